use super::common::{Addr, CacheSpec};
use super::line::CacheLine;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LineId(pub usize);

/// Physical line storage and replacement policy used by the controller.
///
/// Allocation is split in two: `victim` picks a slot (the controller runs the
/// eviction of whatever lives there through the coherence engine) and
/// `install` binds the slot to a fresh `I` line for the new address.
pub trait LineStore {
    fn find(&self, addr: Addr) -> Option<LineId>;
    /// update replacement metadata
    fn touch(&mut self, id: LineId);
    fn victim(&mut self, addr: Addr) -> LineId;
    fn install(&mut self, id: LineId, addr: Addr);
    fn free(&mut self, id: LineId);
    fn line(&self, id: LineId) -> Option<&CacheLine>;
    fn line_mut(&mut self, id: LineId) -> Option<&mut CacheLine>;

    fn lookup(&mut self, addr: Addr, touch: bool) -> Option<LineId> {
        let id = self.find(addr)?;
        if touch {
            self.touch(id);
        }
        Some(id)
    }
}

// set-associative store with LRU replacement

#[derive(Clone, Debug, Default)]
struct Slot {
    line: Option<CacheLine>,
    last_used: u64,
}

pub struct SetAssocStore {
    line_size: u64,
    num_sets: usize,
    assoc: usize,
    slots: Vec<Slot>,
    mru_ctr: u64,
}

impl SetAssocStore {
    pub fn new(spec: &CacheSpec) -> Self {
        SetAssocStore {
            line_size: spec.line_size,
            num_sets: spec.num_sets(),
            assoc: spec.assoc,
            slots: vec![Slot::default(); spec.num_lines],
            mru_ctr: 0,
        }
    }

    fn set_range(&self, addr: Addr) -> std::ops::Range<usize> {
        let set = (addr.line_number(self.line_size) % self.num_sets as u64) as usize;
        set * self.assoc..(set + 1) * self.assoc
    }
    fn bump(&mut self) -> u64 {
        self.mru_ctr += 1;
        self.mru_ctr
    }
}

impl LineStore for SetAssocStore {
    fn find(&self, addr: Addr) -> Option<LineId> {
        self.set_range(addr)
            .find(|&i| self.slots[i].line.as_ref().map_or(false, |l| l.base_addr() == addr))
            .map(LineId)
    }

    fn touch(&mut self, id: LineId) {
        let t = self.bump();
        self.slots[id.0].last_used = t;
    }

    /// empty slots first, then invalid lines, then the least recently used
    fn victim(&mut self, addr: Addr) -> LineId {
        let range = self.set_range(addr);
        let slots = &self.slots[range.clone()];
        let pick = slots
            .iter()
            .position(|s| s.line.is_none())
            .or_else(|| slots.iter().position(|s| s.line.as_ref().map_or(false, |l| !l.valid())))
            .or_else(|| {
                slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(i, _)| i)
            })
            .unwrap_or(0);
        LineId(range.start + pick)
    }

    fn install(&mut self, id: LineId, addr: Addr) {
        let t = self.bump();
        self.slots[id.0] = Slot { line: Some(CacheLine::new(addr, self.line_size)), last_used: t };
    }

    fn free(&mut self, id: LineId) {
        self.slots[id.0] = Slot::default();
    }

    fn line(&self, id: LineId) -> Option<&CacheLine> {
        self.slots.get(id.0)?.line.as_ref()
    }

    fn line_mut(&mut self, id: LineId) -> Option<&mut CacheLine> {
        self.slots.get_mut(id.0)?.line.as_mut()
    }
}
