use std::fmt;

use super::common::{Addr, EventId};
use super::line::LineState;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Command {
    GetS,
    GetX,
    GetSEx,
    GetSResp,
    GetXResp,
    PutS,
    PutE,
    PutM,
    Inv,
    Fetch,
    FetchInv,
    FetchInvX,
    FetchResp,
    FetchXResp,
    AckInv,
    AckPut,
    FlushLine,
    FlushLineInv,
    FlushLineResp,
    Nack,
}

impl Command {
    pub fn is_request(&self) -> bool {
        matches!(self, Command::GetS | Command::GetX | Command::GetSEx)
    }
    pub fn is_put(&self) -> bool {
        matches!(self, Command::PutS | Command::PutE | Command::PutM)
    }
    pub fn is_flush(&self) -> bool {
        matches!(self, Command::FlushLine | Command::FlushLineInv)
    }
    /// invalidations and fetches sent by the level below
    pub fn is_probe(&self) -> bool {
        matches!(self, Command::Inv | Command::Fetch | Command::FetchInv | Command::FetchInvX)
    }
    /// Commands travelling from an upper level towards memory.
    pub fn travels_down(&self) -> bool {
        use Command::*;
        match self {
            GetS | GetX | GetSEx | PutS | PutE | PutM | FlushLine | FlushLineInv => true,
            FetchResp | FetchXResp | AckInv => true,
            GetSResp | GetXResp | AckPut | FlushLineResp | Inv | Fetch | FetchInv | FetchInvX => false,
            Nack => false,
        }
    }
    /// The command answering this one, if it expects an answer.
    pub fn response(&self) -> Option<Command> {
        use Command::*;
        match self {
            GetS => Some(GetSResp),
            GetX | GetSEx => Some(GetXResp),
            Fetch | FetchInv => Some(FetchResp),
            FetchInvX => Some(FetchXResp),
            Inv => Some(AckInv),
            PutS | PutE | PutM => Some(AckPut),
            FlushLine | FlushLineInv => Some(FlushLineResp),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Up,
    Down,
}

/// A coherence message exchanged between neighbouring components.
#[derive(Clone, Debug)]
pub struct ProtocolEvent {
    pub id: EventId,
    pub response_to: Option<EventId>,
    pub cmd: Command,
    pub base_addr: Addr,
    pub src: String,
    pub dst: String,
    /// component that started the transaction
    pub rqstr: String,
    pub payload: Vec<u8>,
    pub dirty: bool,
    pub granted: Option<LineState>,
    pub in_progress: bool,
    pub blocked: bool,
    pub in_mshr: bool,
    pub retries: u32,
    pub nacked: Option<Box<ProtocolEvent>>,
}

impl ProtocolEvent {
    pub fn new(id: EventId, cmd: Command, base_addr: Addr, src: &str) -> Self {
        ProtocolEvent {
            id,
            response_to: None,
            cmd,
            base_addr,
            src: src.to_string(),
            dst: String::new(),
            rqstr: src.to_string(),
            payload: Vec::new(),
            dirty: false,
            granted: None,
            in_progress: false,
            blocked: false,
            in_mshr: false,
            retries: 0,
            nacked: None,
        }
    }

    pub fn with_dst(mut self, dst: &str) -> Self {
        self.dst = dst.to_string();
        self
    }
    pub fn with_rqstr(mut self, rqstr: &str) -> Self {
        self.rqstr = rqstr.to_string();
        self
    }
    pub fn with_payload(mut self, payload: Vec<u8>, dirty: bool) -> Self {
        self.payload = payload;
        self.dirty = dirty;
        self
    }

    /// Builds the answer to this event, addressed back to its source.
    ///
    /// Panics on commands that are never answered; asking for one is a
    /// protocol bug in the caller.
    pub fn make_response(&self, id: EventId, src: &str) -> ProtocolEvent {
        let cmd = match self.cmd.response() {
            Some(cmd) => cmd,
            None => panic!("{}: no response defined for {} {}", src, self.cmd, self.base_addr),
        };
        ProtocolEvent {
            response_to: Some(self.id),
            dst: self.src.clone(),
            rqstr: self.rqstr.clone(),
            ..ProtocolEvent::new(id, cmd, self.base_addr, src)
        }
    }

    /// Rejects this event back to its sender, carrying a copy for the retry.
    pub fn make_nack(&self, id: EventId, src: &str) -> ProtocolEvent {
        ProtocolEvent {
            response_to: Some(self.id),
            dst: self.src.clone(),
            rqstr: self.rqstr.clone(),
            nacked: Some(Box::new(self.clone())),
            ..ProtocolEvent::new(id, Command::Nack, self.base_addr, src)
        }
    }

    /// Same message under another command, used when a flush stands in for a
    /// replacement.
    pub fn as_cmd(&self, cmd: Command) -> ProtocolEvent {
        ProtocolEvent { cmd, ..self.clone() }
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({} -> {}, id {}", self.cmd, self.base_addr, self.src, self.dst, self.id)?;
        if self.dirty {
            write!(f, ", dirty")?;
        }
        write!(f, ")")
    }
}
