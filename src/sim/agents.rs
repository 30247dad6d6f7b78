// Stand-ins for the neighbours of a cache controller: private L1 caches that
// replay an operation trace, and a flat memory below.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use log::{debug, info, trace, warn};

use crate::mesi::{Addr, CacheSpec, Command, EventIds, LineState, ProtocolEvent};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    Read(Addr),
    Write(Addr, u8),
    Evict(Addr),
    Flush(Addr),
    FlushInv(Addr),
}

impl Op {
    pub fn addr(&self) -> Addr {
        match *self {
            Op::Read(a) | Op::Write(a, _) | Op::Evict(a) | Op::Flush(a) | Op::FlushInv(a) => a,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Read(a) => write!(f, "R {}", a),
            Op::Write(a, v) => write!(f, "W {} <- {}", a, v),
            Op::Evict(a) => write!(f, "EVICT {}", a),
            Op::Flush(a) => write!(f, "FLUSH {}", a),
            Op::FlushInv(a) => write!(f, "FLUSHINV {}", a),
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct PeerStats {
    pub hits: u64,
    pub misses: u64,
    pub nacks: u64,
    pub probes: u64,
    /// (address, byte) for every completed read, in program order
    pub reads: Vec<(Addr, u8)>,
}

#[derive(Clone, Debug)]
struct PeerLine {
    state: LineState,
    data: Vec<u8>,
}

/// A private cache directly above the controller under test. It keeps only
/// stable states and has at most one operation outstanding.
pub struct PeerCache {
    name: String,
    below: String,
    line_size: u64,
    lines: HashMap<Addr, PeerLine>,
    ops: VecDeque<Op>,
    outstanding: Option<Op>,
    retry: Option<(u64, ProtocolEvent)>,
    ids: EventIds,
    pub stats: PeerStats,
}

impl PeerCache {
    pub fn new(name: &str, below: &str, line_size: u64, ops: Vec<Op>, ids: EventIds) -> Self {
        PeerCache {
            name: name.to_string(),
            below: below.to_string(),
            line_size,
            lines: HashMap::new(),
            ops: ops.into(),
            outstanding: None,
            retry: None,
            ids,
            stats: PeerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn push_op(&mut self, op: Op) {
        self.ops.push_back(op);
    }
    pub fn is_done(&self) -> bool {
        self.ops.is_empty() && self.outstanding.is_none()
    }
    pub fn is_waiting(&self) -> bool {
        self.outstanding.is_some()
    }
    pub fn state(&self, addr: Addr) -> LineState {
        self.lines.get(&addr.base(self.line_size)).map_or(LineState::Invalid, |l| l.state)
    }
    pub fn byte(&self, addr: Addr) -> Option<u8> {
        let line = self.lines.get(&addr.base(self.line_size))?;
        if !line.state.is_stable() || line.state == LineState::Invalid {
            return None;
        }
        line.data.get(self.offset(addr)).copied()
    }

    fn offset(&self, addr: Addr) -> usize {
        (addr.0 - addr.base(self.line_size).0) as usize
    }
    fn request(&mut self, cmd: Command, addr: Addr) -> ProtocolEvent {
        ProtocolEvent::new(self.ids.next(), cmd, addr, &self.name).with_dst(&self.below)
    }

    /// Issues the next operation when nothing is outstanding, or the pending
    /// retry once its back-off has elapsed.
    pub fn tick(&mut self, now: u64) -> Vec<ProtocolEvent> {
        if let Some(at) = self.retry.as_ref().map(|(at, _)| *at) {
            if at > now {
                return Vec::new();
            }
            return self.retry.take().map(|(_, ev)| ev).into_iter().collect();
        }
        if self.outstanding.is_some() {
            return Vec::new();
        }
        let Some(op) = self.ops.pop_front() else {
            return Vec::new();
        };
        self.issue(op)
    }

    fn issue(&mut self, op: Op) -> Vec<ProtocolEvent> {
        let base = op.addr().base(self.line_size);
        let state = self.state(base);
        trace!("{}: {} in {}", self.name, op, state);
        match op {
            Op::Read(addr) => {
                if state != LineState::Invalid {
                    self.stats.hits += 1;
                    self.complete_read(addr);
                    return Vec::new();
                }
                self.stats.misses += 1;
                self.outstanding = Some(op);
                vec![self.request(Command::GetS, base)]
            }
            Op::Write(addr, value) => {
                if matches!(state, LineState::Exclusive | LineState::Modified) {
                    self.stats.hits += 1;
                    self.write_byte(addr, value);
                    return Vec::new();
                }
                self.stats.misses += 1;
                self.outstanding = Some(op);
                vec![self.request(Command::GetX, base)]
            }
            Op::Evict(_) => {
                let cmd = match state {
                    LineState::Shared => Command::PutS,
                    LineState::Exclusive => Command::PutE,
                    LineState::Modified => Command::PutM,
                    _ => return Vec::new(),
                };
                let Some(line) = self.lines.remove(&base) else {
                    return Vec::new();
                };
                let put = self
                    .request(cmd, base)
                    .with_payload(line.data, cmd == Command::PutM);
                vec![put]
            }
            Op::Flush(_) | Op::FlushInv(_) => {
                let inv = matches!(op, Op::FlushInv(_));
                let cmd = if inv { Command::FlushLineInv } else { Command::FlushLine };
                let mut flush = self.request(cmd, base);
                if let Some(line) = self.lines.get_mut(&base) {
                    if line.state != LineState::Invalid {
                        flush = flush.with_payload(line.data.clone(), line.state == LineState::Modified);
                        line.state = if inv { LineState::Invalid } else { LineState::Shared };
                    }
                }
                if inv {
                    self.lines.remove(&base);
                }
                self.outstanding = Some(op);
                vec![flush]
            }
        }
    }

    fn complete_read(&mut self, addr: Addr) {
        let value = self.byte(addr).unwrap_or_default();
        self.stats.reads.push((addr, value));
    }

    fn write_byte(&mut self, addr: Addr, value: u8) {
        let offset = self.offset(addr);
        if let Some(line) = self.lines.get_mut(&addr.base(self.line_size)) {
            if let Some(b) = line.data.get_mut(offset) {
                *b = value;
            }
            line.state = LineState::Modified;
        }
    }

    fn fill(&mut self, addr: Addr, state: LineState, payload: &[u8]) {
        let data = if payload.is_empty() { vec![0; self.line_size as usize] } else { payload.to_vec() };
        self.lines.insert(addr, PeerLine { state, data });
    }

    /// Reacts to a message from below. Returns the messages to send back.
    pub fn handle(&mut self, event: ProtocolEvent, now: u64) -> Vec<ProtocolEvent> {
        let addr = event.base_addr;
        match event.cmd {
            Command::GetSResp | Command::GetXResp => {
                let granted = match (event.cmd, event.granted) {
                    (Command::GetXResp, _) => LineState::Modified,
                    (_, Some(g)) => g,
                    _ => LineState::Shared,
                };
                self.fill(addr, granted, &event.payload);
                match self.outstanding.take() {
                    Some(Op::Read(a)) => self.complete_read(a),
                    Some(Op::Write(a, v)) => self.write_byte(a, v),
                    other => warn!("{}: {} with {:?} outstanding", self.name, event.cmd, other),
                }
                debug!("{}: t={} filled {} in {}", self.name, now, addr, granted);
                Vec::new()
            }
            Command::FlushLineResp => {
                if !matches!(self.outstanding.take(), Some(Op::Flush(_) | Op::FlushInv(_))) {
                    warn!("{}: unexpected {}", self.name, event);
                }
                Vec::new()
            }
            Command::AckPut => Vec::new(),
            Command::Nack => {
                self.stats.nacks += 1;
                if let Some(orig) = event.nacked {
                    let mut orig = *orig;
                    orig.retries += 1;
                    let at = now + (1u64 << orig.retries.min(10));
                    debug!("{}: NACKed {}, retry at {}", self.name, orig, at);
                    self.retry = Some((at, orig));
                }
                Vec::new()
            }
            Command::Inv | Command::Fetch | Command::FetchInv | Command::FetchInvX => self.probe(event),
            _ => {
                warn!("{}: cannot handle {}", self.name, event);
                Vec::new()
            }
        }
    }

    fn probe(&mut self, event: ProtocolEvent) -> Vec<ProtocolEvent> {
        let addr = event.base_addr;
        let Some(line) = self.lines.get_mut(&addr) else {
            // our Put crossed the probe
            trace!("{}: no copy for {}", self.name, event);
            return Vec::new();
        };
        self.stats.probes += 1;
        let dirty = line.state == LineState::Modified;
        let mut resp = event.make_response(self.ids.next(), &self.name);
        match event.cmd {
            Command::Inv => {
                self.lines.remove(&addr);
            }
            Command::FetchInv => {
                resp = resp.with_payload(line.data.clone(), dirty);
                self.lines.remove(&addr);
            }
            Command::FetchInvX => {
                resp = resp.with_payload(line.data.clone(), dirty);
                line.state = LineState::Shared;
            }
            _ => resp = resp.with_payload(line.data.clone(), false),
        }
        vec![resp]
    }
}

/// Backing memory: grants every request, absorbs writebacks and flushes.
pub struct Memory {
    name: String,
    spec: CacheSpec,
    data: HashMap<Addr, Vec<u8>>,
    ids: EventIds,
    pub writebacks: u64,
}

impl Memory {
    pub fn new(name: &str, spec: CacheSpec, ids: EventIds) -> Self {
        info!("{}: memory, {}-byte lines", name, spec.line_size);
        Memory { name: name.to_string(), spec, data: HashMap::new(), ids, writebacks: 0 }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn line(&self, addr: Addr) -> Vec<u8> {
        self.data
            .get(&addr.base(self.spec.line_size))
            .cloned()
            .unwrap_or_else(|| vec![0; self.spec.line_size as usize])
    }

    fn store(&mut self, event: &ProtocolEvent) {
        if event.has_payload() {
            self.data.insert(event.base_addr, event.payload.clone());
        }
    }

    pub fn handle(&mut self, event: ProtocolEvent) -> Vec<ProtocolEvent> {
        let addr = event.base_addr;
        let mut resp = match event.cmd.response() {
            Some(_) => event.make_response(self.ids.next(), &self.name),
            None => {
                warn!("{}: ignoring {}", self.name, event);
                return Vec::new();
            }
        };
        match event.cmd {
            Command::GetS => {
                resp.payload = self.line(addr);
                resp.granted = Some(if self.spec.mesi() { LineState::Exclusive } else { LineState::Shared });
            }
            Command::GetX | Command::GetSEx => {
                resp.payload = self.line(addr);
                resp.granted = Some(LineState::Modified);
            }
            Command::PutS | Command::PutE | Command::PutM => {
                self.writebacks += 1;
                self.store(&event);
                if !self.spec.expect_writeback_ack {
                    return Vec::new();
                }
            }
            Command::FlushLine | Command::FlushLineInv => self.store(&event),
            _ => {
                warn!("{}: unexpected {}", self.name, event);
                return Vec::new();
            }
        }
        debug!("{}: {} -> {}", self.name, event, resp.cmd);
        vec![resp]
    }
}
