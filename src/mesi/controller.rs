use std::collections::VecDeque;

use log::{debug, info, trace};

use super::coherence::{CacheAction, CoherenceEngine, EngineCtx, MissKind};
use super::common::{Addr, CacheSpec, ConfigError, EventIds};
use super::event::{Command, Direction, ProtocolEvent};
use super::line::{CacheLine, LineState};
use super::mshr::{Mshr, MshrEntry};
use super::outgoing::Response;
use super::store::{LineStore, SetAssocStore};

/// One cache level: routes incoming events through the coherence engine,
/// allocates lines and parks or replays work in the MSHR.
pub struct CacheController<S: LineStore = SetAssocStore> {
    name: String,
    spec: CacheSpec,
    engine: CoherenceEngine,
    mshr: Mshr,
    store: S,
    ids: EventIds,
    clock: u64,
}

impl CacheController<SetAssocStore> {
    pub fn new(
        name: &str,
        spec: CacheSpec,
        upper: Vec<String>,
        lower: Vec<String>,
        ids: EventIds,
    ) -> Result<Self, ConfigError> {
        spec.validate()?;
        let store = SetAssocStore::new(&spec);
        Ok(Self::with_store(name, spec, upper, lower, store, ids))
    }
}

impl<S: LineStore> CacheController<S> {
    pub fn with_store(name: &str, spec: CacheSpec, upper: Vec<String>, lower: Vec<String>, store: S, ids: EventIds) -> Self {
        info!(
            "{}: {:?} {:?} cache, {} lines x {} bytes, {} MSHR entries",
            name, spec.protocol, spec.inclusion, spec.num_lines, spec.line_size, spec.mshr_entries
        );
        CacheController {
            name: name.to_string(),
            spec,
            engine: CoherenceEngine::new(name, spec, upper, lower),
            mshr: Mshr::new(name, spec.mshr_entries),
            store,
            ids,
            clock: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }
    pub fn clock(&self) -> u64 {
        self.clock
    }
    pub fn set_clock(&mut self, now: u64) {
        self.clock = now;
    }
    pub fn mshr(&self) -> &Mshr {
        &self.mshr
    }
    pub fn line(&self, addr: Addr) -> Option<&CacheLine> {
        self.store.find(addr).and_then(|id| self.store.line(id))
    }
    /// nothing parked, nothing left to send
    pub fn is_idle(&self) -> bool {
        self.mshr.is_empty() && !self.engine.has_pending()
    }

    /// Messages due by the current clock, in delivery order per direction.
    pub fn drain_outgoing(&mut self) -> Vec<(Direction, ProtocolEvent)> {
        self.engine.drain_ready(self.clock)
    }
    /// Everything queued, due or not.
    pub fn pending_outgoing(&self) -> impl Iterator<Item = (Direction, &Response)> {
        self.engine.pending()
    }

    pub fn submit(&mut self, event: ProtocolEvent) {
        debug!("{}: t={} recv {}", self.name, self.clock, event);
        let addr = event.base_addr;
        self.process_event(event, false);
        self.free_if_retired(addr);
    }

    /// Gives back the slot of a line that ended up invalid with nothing
    /// parked or outstanding for it.
    fn free_if_retired(&mut self, addr: Addr) {
        if self.mshr.is_hit(addr) || self.mshr.acks_needed(addr) > 0 {
            return;
        }
        let Some(id) = self.store.find(addr) else {
            return;
        };
        if self.store.line(id).map_or(false, |l| l.state() == LineState::Invalid) {
            trace!("{}: freeing {}", self.name, addr);
            self.store.free(id);
        }
    }

    fn process_event(&mut self, mut event: ProtocolEvent, replay: bool) {
        let addr = event.base_addr;
        if replay {
            trace!("{}: replay {}", self.name, event);
        }
        match event.cmd {
            Command::GetS | Command::GetX | Command::GetSEx => {
                if !replay && self.mshr.is_almost_full() {
                    debug!("{}: MSHR almost full, rejecting {}", self.name, event);
                    self.send_nack(event);
                    return;
                }
                if self.mshr.is_hit(addr) {
                    event.blocked = true;
                    self.park(event);
                    return;
                }
                self.process_cache_request(event, replay);
            }
            Command::GetSResp | Command::GetXResp => self.process_cache_response(event),
            Command::PutS | Command::PutE | Command::PutM | Command::FlushLine | Command::FlushLineInv => {
                self.process_cache_replacement(event, replay)
            }
            Command::Inv | Command::Fetch | Command::FetchInv | Command::FetchInvX => {
                self.process_cache_invalidate(event, replay)
            }
            Command::AckInv | Command::AckPut | Command::FetchResp | Command::FetchXResp | Command::FlushLineResp => {
                self.process_fetch_resp(event)
            }
            Command::Nack => self.process_incoming_nack(event),
        }
    }

    fn process_cache_request(&mut self, mut event: ProtocolEvent, replay: bool) {
        let addr = event.base_addr;
        let found = self.store.lookup(addr, !replay);
        if let Some(line) = found.and_then(|id| self.store.line(id)) {
            if line.in_transition() {
                self.park(event);
                return;
            }
            if !replay {
                let miss = self.engine.is_coherence_miss(&event, Some(line));
                if miss != MissKind::Hit {
                    debug!("{}: {} {} is a miss ({:?})", self.name, event.cmd, addr, miss);
                }
            }
        }

        if self.spec.inclusive() {
            if found.is_none() && !self.allocate_line(addr) {
                self.park(event);
                return;
            }
        } else if !found.and_then(|id| self.store.line(id)).map_or(false, |l| l.valid()) {
            // non-inclusive miss: fetch for the requester without allocating
            if event.in_progress {
                self.park(event);
                return;
            }
            if self.mshr.is_full() {
                self.send_nack(event);
                return;
            }
            let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
            self.engine.forward_request(&event, &mut ctx);
            event.in_progress = true;
            self.park(event);
            return;
        }

        let line = match self.store.find(addr).and_then(|id| self.store.line_mut(id)) {
            Some(line) => line,
            None => panic!("{}: no line for {} after allocation", self.name, addr),
        };
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        let action = self.engine.handle_request(&event, line, replay, &mut ctx);
        if action == CacheAction::Done {
            self.post_request_processing(addr);
        } else {
            self.park(event);
        }
    }

    fn process_cache_response(&mut self, event: ProtocolEvent) {
        let addr = event.base_addr;
        let Some(parked) = self.answered_event(&event) else {
            panic!("{}: {} for {} with no request waiting", self.name, event.cmd, addr);
        };
        let line = self.store.find(addr).and_then(|id| self.store.line_mut(id));
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        let action = self.engine.handle_response(&event, line, Some(&parked), &mut ctx);
        if action == CacheAction::Done {
            self.mshr.remove_element(addr, parked.id);
            self.post_request_processing(addr);
        }
    }

    fn process_cache_replacement(&mut self, mut event: ProtocolEvent, replay: bool) {
        let addr = event.base_addr;
        if !self.spec.inclusive() && event.cmd.is_put() {
            let found = self.store.lookup(addr, true);
            if found.is_none() && !self.allocate_line(addr) {
                if self.mshr.acks_needed(addr) == 0 {
                    self.park(event);
                    return;
                }
                debug!("{}: no line for {}, resolving race without one", self.name, event);
            }
        }

        let parked = self.front_event(addr);
        let line = self.store.find(addr).and_then(|id| self.store.line_mut(id));
        // only a line that is waiting on something can have its parked event
        // resolved by this replacement
        let resolving = self.mshr.acks_needed(addr) > 0 || line.as_ref().map_or(true, |l| l.in_transition());
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        let action = self.engine.handle_replacement(&mut event, line, parked.as_ref(), replay, &mut ctx);

        if matches!(action, CacheAction::Done | CacheAction::Stall) && parked.is_some() && resolving {
            self.mshr.remove_front(addr);
        }
        match action {
            CacheAction::Stall | CacheAction::Block => {
                let flush = event.cmd.is_flush();
                self.park(event);
                if flush && action == CacheAction::Stall {
                    self.activate_prev_events(addr);
                }
            }
            CacheAction::Done => self.activate_prev_events(addr),
            CacheAction::Ignore => {}
        }
    }

    fn process_cache_invalidate(&mut self, mut event: ProtocolEvent, replay: bool) {
        let addr = event.base_addr;
        if !self.mshr.pending_writeback(addr) && self.mshr.is_full() {
            debug!("{}: MSHR full, rejecting {}", self.name, event);
            self.send_nack(event);
            return;
        }
        let collision = self.front_event(addr);
        let line = self.store.find(addr).and_then(|id| self.store.line_mut(id));
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        let action = self.engine.handle_invalidation_request(&mut event, line, collision.as_ref(), replay, &mut ctx);
        match action {
            CacheAction::Stall => self.park_probe(event, false),
            CacheAction::Block => self.park_probe(event, true),
            CacheAction::Done => self.activate_prev_events(addr),
            CacheAction::Ignore => trace!("{}: dropped {}", self.name, event),
        }
    }

    /// Acknowledgements and fetch responses from above, AckPut and
    /// FlushLineResp from below.
    fn process_fetch_resp(&mut self, event: ProtocolEvent) {
        let addr = event.base_addr;
        let parked = if event.cmd == Command::FlushLineResp {
            self.answered_event(&event)
        } else if event.cmd == Command::AckPut {
            None
        } else {
            self.front_event(addr)
        };
        let line = self.store.find(addr).and_then(|id| self.store.line_mut(id));
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        let action = self.engine.handle_response(&event, line, parked.as_ref(), &mut ctx);
        if action != CacheAction::Done {
            return;
        }
        if let Some(parked) = parked {
            if event.cmd == Command::FlushLineResp {
                self.mshr.remove_element(addr, parked.id);
            } else {
                self.mshr.remove_front(addr);
            }
        }
        self.activate_prev_events(addr);
    }

    fn process_incoming_nack(&mut self, nack: ProtocolEvent) {
        let Some(orig) = nack.nacked else {
            panic!("{}: NACK for {} carries no event", self.name, nack.base_addr);
        };
        let line = self.store.find(orig.base_addr).and_then(|id| self.store.line(id));
        if !self.engine.is_retry_needed(&orig, line, &self.mshr) {
            debug!("{}: dropping NACKed {}", self.name, orig);
            return;
        }
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        self.engine.resend_event(*orig, &mut ctx);
    }

    /// Makes room for `addr`. Returns false when the victim is busy; the
    /// victim then points back at `addr` so the request is retried once the
    /// victim settles.
    fn allocate_line(&mut self, addr: Addr) -> bool {
        let victim = self.store.victim(addr);
        if let Some(line) = self.store.line_mut(victim) {
            let victim_addr = line.base_addr();
            if line.valid() {
                if line.in_transition() {
                    self.mshr.insert_pointer(victim_addr, addr);
                    return false;
                }
                let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
                if self.engine.handle_eviction(line, &mut ctx) == CacheAction::Stall {
                    self.mshr.insert_pointer(victim_addr, addr);
                    return false;
                }
            }
        }
        self.store.install(victim, addr);
        true
    }

    fn post_request_processing(&mut self, addr: Addr) {
        if self.mshr.is_hit(addr) {
            self.activate_prev_events(addr);
        }
    }

    /// Replays the events parked for `addr` in order until one of them parks
    /// new work. Probes from below are let through even then, as is a flush
    /// from a cache the stalled event is waiting on.
    fn activate_prev_events(&mut self, addr: Addr) {
        if !self.mshr.is_hit(addr) {
            return;
        }
        let mut entries = self.mshr.remove_all(addr);
        trace!("{}: activating {} entries for {}", self.name, entries.len(), addr);
        let mut writeback_pending = false;
        if matches!(entries.front(), Some(MshrEntry::WritebackMarker)) {
            entries.pop_front();
            writeback_pending = true;
        }

        while let Some(entry) = entries.pop_front() {
            match entry {
                MshrEntry::Parked(event) => {
                    if writeback_pending {
                        if !event.cmd.is_probe() {
                            entries.push_front(MshrEntry::Parked(event));
                            break;
                        }
                        // the probe consumes the writeback
                        writeback_pending = false;
                    }
                    self.process_event(event, true);
                }
                MshrEntry::Pointer(pointer) => {
                    if self.mshr.is_hit(pointer) {
                        self.replay_pointer(pointer);
                    }
                }
                MshrEntry::WritebackMarker => {
                    entries.push_front(MshrEntry::WritebackMarker);
                    break;
                }
            }
            if self.mshr.is_hit(addr) && !next_is_probe(&entries) {
                match self.take_crossed_flush(addr, &mut entries) {
                    Some(flush) => entries.push_front(MshrEntry::Parked(flush)),
                    None => break,
                }
            }
        }

        self.mshr.insert_all(addr, entries);
        if writeback_pending {
            self.mshr.insert_writeback(addr);
        }
    }

    /// Replays the work of another address that waited on a victim here.
    fn replay_pointer(&mut self, pointer: Addr) {
        let mut entries = self.mshr.remove_all(pointer);
        let mut writeback_pending = false;
        let mut kept = VecDeque::new();
        while let Some(entry) = entries.pop_front() {
            match entry {
                MshrEntry::Parked(event) => {
                    self.process_event(event, true);
                    if self.mshr.is_hit(pointer) && !next_is_probe(&entries) {
                        match self.take_crossed_flush(pointer, &mut entries) {
                            Some(flush) => entries.push_front(MshrEntry::Parked(flush)),
                            None => break,
                        }
                    }
                }
                MshrEntry::WritebackMarker => {
                    debug!("{}: {} still waits for a writeback ack", self.name, pointer);
                    writeback_pending = true;
                    break;
                }
                other => kept.push_back(other),
            }
        }
        kept.extend(entries);
        self.mshr.insert_all(pointer, kept);
        if writeback_pending {
            self.mshr.insert_writeback(pointer);
        }
    }

    /// A FlushLineInv parked behind a request that is now invalidating the
    /// flushing cache. That cache already dropped its copy and will not
    /// answer the probe, so the flush has to stand in for the acknowledgement.
    fn take_crossed_flush(&self, addr: Addr, entries: &mut VecDeque<MshrEntry>) -> Option<ProtocolEvent> {
        if self.mshr.acks_needed(addr) == 0 {
            return None;
        }
        let line = self.line(addr)?;
        let pos = entries.iter().position(|e| {
            matches!(e, MshrEntry::Parked(ev)
                if ev.cmd == Command::FlushLineInv && (line.is_owner(&ev.src) || line.is_sharer(&ev.src)))
        })?;
        match entries.remove(pos) {
            Some(MshrEntry::Parked(flush)) => {
                trace!("{}: {} answers the invalidation it crossed", self.name, flush);
                Some(flush)
            }
            _ => None,
        }
    }

    /// The parked event a response from below answers. Probes may have been
    /// queued in front of it, so it is matched by id first.
    fn answered_event(&self, response: &ProtocolEvent) -> Option<ProtocolEvent> {
        let addr = response.base_addr;
        self.mshr
            .entries(addr)
            .filter_map(|e| e.event())
            .find(|ev| Some(ev.id) == response.response_to)
            .or_else(|| self.mshr.lookup_front(addr))
            .cloned()
    }

    fn front_event(&self, addr: Addr) -> Option<ProtocolEvent> {
        self.mshr.lookup_front(addr).cloned()
    }

    fn park(&mut self, event: ProtocolEvent) {
        let addr = event.base_addr;
        if let Err(event) = self.mshr.insert(addr, event) {
            debug!("{}: MSHR full, rejecting {}", self.name, event);
            self.send_nack(event);
        }
    }

    fn park_probe(&mut self, event: ProtocolEvent, behind_front: bool) {
        let addr = event.base_addr;
        if let Err(event) = self.mshr.insert_inv(addr, event, behind_front) {
            self.send_nack(event);
        }
    }

    fn send_nack(&mut self, event: ProtocolEvent) {
        let mut ctx = EngineCtx::new(self.clock, &mut self.mshr, &mut self.ids);
        self.engine.send_nack(event, &mut ctx);
    }
}

fn next_is_probe(entries: &VecDeque<MshrEntry>) -> bool {
    matches!(entries.front(), Some(MshrEntry::Parked(ev)) if ev.cmd.is_probe())
}
