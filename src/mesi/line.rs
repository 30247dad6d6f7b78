use std::collections::BTreeSet;
use std::fmt;

use super::common::Addr;

/// Coherence state of a line held by this cache.
///
/// `Invalid`, `Shared`, `Exclusive` and `Modified` are stable. The rest are
/// transient: the line waits for data (`IS`, `IM`, `SM`), for acknowledgements
/// from the level above (`*Inv`, `*InvX`, `SI`, `EI`, `MI`), for a flush to be
/// acknowledged by the level below (`SB`, `IB`, `SBInv`) or for a fill that a
/// fetch raced with (`SD`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum LineState {
    #[default]
    Invalid,
    Shared,
    Exclusive,
    Modified,
    IS,
    IM,
    SM,
    SInv,
    SMInv,
    EInv,
    MInv,
    EInvX,
    MInvX,
    SI,
    EI,
    MI,
    SB,
    IB,
    SBInv,
    SD,
}

impl LineState {
    pub fn is_stable(&self) -> bool {
        matches!(self, LineState::Invalid | LineState::Shared | LineState::Exclusive | LineState::Modified)
    }
    pub fn in_transition(&self) -> bool {
        !self.is_stable()
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use LineState::*;
        let s = match self {
            Invalid => "I",
            Shared => "S",
            Exclusive => "E",
            Modified => "M",
            IS => "IS",
            IM => "IM",
            SM => "SM",
            SInv => "S_Inv",
            SMInv => "SM_Inv",
            EInv => "E_Inv",
            MInv => "M_Inv",
            EInvX => "E_InvX",
            MInvX => "M_InvX",
            SI => "SI",
            EI => "EI",
            MI => "MI",
            SB => "S_B",
            IB => "I_B",
            SBInv => "SB_Inv",
            SD => "S_D",
        };
        f.write_str(s)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CacheLine {
    base_addr: Addr,
    state: LineState,
    data: Vec<u8>,
    sharers: BTreeSet<String>,
    owner: Option<String>,
    timestamp: u64,
}

impl CacheLine {
    pub fn new(base_addr: Addr, line_size: u64) -> Self {
        CacheLine {
            base_addr,
            state: LineState::Invalid,
            data: vec![0; line_size as usize],
            sharers: BTreeSet::new(),
            owner: None,
            timestamp: 0,
        }
    }

    pub fn base_addr(&self) -> Addr {
        self.base_addr
    }
    pub fn state(&self) -> LineState {
        self.state
    }
    pub fn set_state(&mut self, state: LineState) {
        self.state = state;
    }
    pub fn valid(&self) -> bool {
        self.state != LineState::Invalid
    }
    pub fn is_stable(&self) -> bool {
        self.state.is_stable()
    }
    pub fn in_transition(&self) -> bool {
        self.state.in_transition()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
    /// Replaces the line contents. An empty payload leaves the data untouched.
    pub fn set_data(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.data = data.to_vec();
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
    pub fn set_timestamp(&mut self, t: u64) {
        self.timestamp = t;
    }

    pub fn sharers(&self) -> impl Iterator<Item = &str> {
        self.sharers.iter().map(|s| s.as_str())
    }
    pub fn num_sharers(&self) -> usize {
        self.sharers.len()
    }
    pub fn is_shareless(&self) -> bool {
        self.sharers.is_empty()
    }
    pub fn is_sharer(&self, name: &str) -> bool {
        self.sharers.contains(name)
    }
    pub fn add_sharer(&mut self, name: &str) {
        if self.owner.as_deref() == Some(name) {
            self.owner = None;
        }
        self.sharers.insert(name.to_string());
    }
    pub fn remove_sharer(&mut self, name: &str) {
        self.sharers.remove(name);
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
    pub fn has_owner(&self) -> bool {
        self.owner.is_some()
    }
    pub fn is_owner(&self, name: &str) -> bool {
        self.owner.as_deref() == Some(name)
    }
    /// Makes `name` the exclusive holder; it stops being a sharer.
    pub fn set_owner(&mut self, name: &str) {
        self.sharers.remove(name);
        self.owner = Some(name.to_string());
    }
    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    /// owner and sharers never coexist
    pub fn check_invariants(&self) -> bool {
        !(self.owner.is_some() && !self.sharers.is_empty())
    }
}

impl fmt::Display for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.base_addr, self.state)?;
        if let Some(owner) = &self.owner {
            write!(f, " owner={}", owner)?;
        }
        if !self.sharers.is_empty() {
            write!(f, " sharers={:?}", self.sharers)?;
        }
        write!(f, "]")
    }
}
