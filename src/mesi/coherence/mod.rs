//! MESI/MSI coherence engine for one cache level.
//!
//! The engine is a pure state machine over `(line state, command)`: it mutates
//! the line and the MSHR bookkeeping it is handed, queues follow-on messages in
//! its two outgoing queues and reports a `CacheAction` telling the controller
//! what to do with the event.

mod eviction;
mod flush;
mod invalidations;
mod replacements;
mod requests;
mod responses;
mod send;

use log::error;

use super::common::{timing, Addr, CacheSpec, EventIds};
use super::event::{Command, Direction, ProtocolEvent};
use super::line::{CacheLine, LineState};
use super::mshr::Mshr;
use super::outgoing::{OutgoingQueue, Response};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheAction {
    /// event fully handled
    Done,
    /// event is being serviced, park it at the front
    Stall,
    /// event must wait behind other work
    Block,
    /// stale event, drop it
    Ignore,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MissKind {
    Hit,
    NotPresent,
    WrongState,
    NeedsInvalidation,
}

/// Per-call view of the controller state the engine may touch.
pub struct EngineCtx<'a> {
    pub now: u64,
    pub mshr: &'a mut Mshr,
    pub ids: &'a mut EventIds,
}

impl<'a> EngineCtx<'a> {
    pub fn new(now: u64, mshr: &'a mut Mshr, ids: &'a mut EventIds) -> Self {
        EngineCtx { now, mshr, ids }
    }
    fn acks(&self, addr: Addr) -> u32 {
        self.mshr.acks_needed(addr)
    }
    fn take_ack(&mut self, addr: Addr) {
        if self.mshr.acks_needed(addr) > 0 {
            self.mshr.decrement_acks_needed(addr);
        }
    }
}

pub struct CoherenceEngine {
    name: String,
    spec: CacheSpec,
    upper: Vec<String>,
    lower: Vec<String>,
    out_up: OutgoingQueue,
    out_down: OutgoingQueue,
}

impl CoherenceEngine {
    pub fn new(name: &str, spec: CacheSpec, upper: Vec<String>, lower: Vec<String>) -> Self {
        CoherenceEngine {
            name: name.to_string(),
            spec,
            upper,
            lower,
            out_up: OutgoingQueue::new(),
            out_down: OutgoingQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    // dispatch

    /// GetS, GetX and GetSEx on an allocated line.
    pub fn handle_request(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        match event.cmd {
            Command::GetS => self.handle_get_s(event, line, replay, ctx),
            Command::GetX | Command::GetSEx => self.handle_get_x(event, line, replay, ctx),
            _ => self.fatal(ctx.now, "not a data request", event, line.state()),
        }
    }

    /// Puts and flushes from above. `parked` is the event at the front of the
    /// MSHR for this address, if any.
    pub fn handle_replacement(
        &mut self,
        event: &mut ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        match event.cmd {
            Command::PutS => self.handle_put_s(event, line, parked, ctx),
            Command::PutE | Command::PutM => self.handle_put_m(event, line, parked, ctx),
            Command::FlushLine | Command::FlushLineInv => self.handle_flush(event, line, parked, replay, ctx),
            _ => self.fatal(ctx.now, "not a replacement", event, state_of(line.as_deref())),
        }
    }

    /// Inv, Fetch, FetchInv and FetchInvX from below.
    pub fn handle_invalidation_request(
        &mut self,
        event: &mut ProtocolEvent,
        line: Option<&mut CacheLine>,
        collision: Option<&ProtocolEvent>,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let line = match line {
            Some(line) if line.valid() => line,
            _ => return self.probe_without_line(event, collision, ctx),
        };
        match event.cmd {
            Command::Inv => self.handle_inv(event, line, replay, ctx),
            Command::Fetch => self.handle_fetch(event, line, replay, ctx),
            Command::FetchInv => self.handle_fetch_inv(event, line, replay, ctx),
            Command::FetchInvX => self.handle_fetch_inv_x(event, line, replay, ctx),
            _ => self.fatal(ctx.now, "not an invalidation", event, line.state()),
        }
    }

    /// Data responses and acknowledgements. `parked` is the event the
    /// response resolves, when one is waiting at the MSHR front.
    pub fn handle_response(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        match event.cmd {
            Command::GetSResp | Command::GetXResp => self.handle_data_response(event, line, parked, ctx),
            Command::FetchResp | Command::FetchXResp => self.handle_fetch_resp(event, line, parked, ctx),
            Command::AckInv => self.handle_ack_inv(event, line, parked, ctx),
            Command::AckPut => {
                ctx.mshr.remove_writeback(event.base_addr);
                CacheAction::Done
            }
            Command::FlushLineResp => self.handle_flush_resp(event, line, parked, ctx),
            _ => self.fatal(ctx.now, "not a response", event, state_of(line.as_deref())),
        }
    }

    // queries

    /// Whether a NACKed event still has to be resent.
    pub fn is_retry_needed(&self, event: &ProtocolEvent, line: Option<&CacheLine>, mshr: &Mshr) -> bool {
        let addr = event.base_addr;
        let state = state_of(line);
        let holds = |name: &str| line.map_or(false, |l| l.is_sharer(name));
        let owns = |name: &str| line.map_or(false, |l| l.is_owner(name));
        match event.cmd {
            Command::GetS | Command::GetX | Command::GetSEx => true,
            Command::FlushLine | Command::FlushLineInv => true,
            // the lower level already saw a racing probe as our writeback
            Command::PutS | Command::PutE | Command::PutM => {
                !(self.spec.expect_writeback_ack && !mshr.pending_writeback(addr))
            }
            Command::FetchInvX => state != LineState::Invalid && owns(&event.dst),
            Command::FetchInv => state != LineState::Invalid && (owns(&event.dst) || holds(&event.dst)),
            Command::Fetch | Command::Inv => state != LineState::Invalid && holds(&event.dst),
            _ => self.fatal(0, "NACK of an unretryable command", event, state),
        }
    }

    /// Classifies a request against the line it hits, for miss accounting.
    pub fn is_coherence_miss(&self, event: &ProtocolEvent, line: Option<&CacheLine>) -> MissKind {
        let Some(line) = line else {
            return MissKind::NotPresent;
        };
        match line.state() {
            LineState::Invalid => MissKind::NotPresent,
            LineState::Shared => {
                if event.cmd == Command::GetS {
                    MissKind::Hit
                } else {
                    MissKind::WrongState
                }
            }
            LineState::Exclusive | LineState::Modified => {
                if line.has_owner() {
                    return MissKind::NeedsInvalidation;
                }
                match event.cmd {
                    Command::GetS => MissKind::Hit,
                    _ if line.is_shareless() => MissKind::Hit,
                    _ if line.is_sharer(&event.src) && line.num_sharers() == 1 => MissKind::Hit,
                    _ => MissKind::NeedsInvalidation,
                }
            }
            _ => MissKind::NeedsInvalidation,
        }
    }

    // outgoing queues

    /// Messages whose delivery time has been reached, upward first.
    pub fn drain_ready(&mut self, now: u64) -> Vec<(Direction, ProtocolEvent)> {
        let mut out = Vec::new();
        while let Some(ev) = self.out_up.pop_ready(now) {
            out.push((Direction::Up, ev));
        }
        while let Some(ev) = self.out_down.pop_ready(now) {
            out.push((Direction::Down, ev));
        }
        out
    }
    pub fn pending(&self) -> impl Iterator<Item = (Direction, &Response)> {
        self.out_up
            .iter()
            .map(|r| (Direction::Up, r))
            .chain(self.out_down.iter().map(|r| (Direction::Down, r)))
    }
    pub fn has_pending(&self) -> bool {
        !self.out_up.is_empty() || !self.out_down.is_empty()
    }

    fn inclusive(&self) -> bool {
        self.spec.inclusive()
    }
    fn delivery(&self, ctx: &EngineCtx, base: u64, class: timing::Latency) -> u64 {
        timing::delivery(&self.spec, ctx.now, base, class)
    }

    /// Unhandled `(state, command)` pair: the simulation cannot continue.
    fn fatal(&self, now: u64, what: &str, event: &ProtocolEvent, state: LineState) -> ! {
        error!(
            "{}: {} at t={}: {} for {} from {} in state {}",
            self.name, what, now, event.cmd, event.base_addr, event.src, state
        );
        panic!(
            "{}: {} at t={}: {} for {} from {} in state {}",
            self.name, what, now, event.cmd, event.base_addr, event.src, state
        );
    }

    /// The event a transition is resolving; having none is a protocol bug.
    fn waiting<'p>(
        &self,
        parked: Option<&'p ProtocolEvent>,
        now: u64,
        event: &ProtocolEvent,
        state: LineState,
    ) -> &'p ProtocolEvent {
        match parked {
            Some(ev) => ev,
            None => self.fatal(now, "no waiting event to resolve", event, state),
        }
    }
}

fn state_of(line: Option<&CacheLine>) -> LineState {
    line.map_or(LineState::Invalid, |l| l.state())
}
