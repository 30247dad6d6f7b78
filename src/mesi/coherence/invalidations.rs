use log::trace;

use super::CacheAction::{self, *};
use super::{CoherenceEngine, EngineCtx};
use crate::mesi::event::ProtocolEvent;
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    /// Probe for a line we do not hold (absent or `I`).
    pub(super) fn probe_without_line(
        &mut self,
        event: &mut ProtocolEvent,
        collision: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        if ctx.mshr.pending_writeback(addr) {
            // our writeback crossed the probe; it serves as the answer
            ctx.mshr.remove_writeback(addr);
            return Done;
        }
        if self.inclusive() {
            trace!("{}: stale {} for {}", self.name, event.cmd, addr);
            return Ignore;
        }
        if collision.map_or(false, |c| c.cmd.is_put()) {
            return Block;
        }
        if event.in_progress {
            // already asked the level above
            return Stall;
        }
        self.forward_up(event, ctx);
        ctx.mshr.set_acks_needed(addr, 1);
        event.in_progress = true;
        Stall
    }

    pub(super) fn handle_inv(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            // eviction raced with the Inv
            IS | IM => Done,
            Shared | SM => {
                if !line.is_shareless() {
                    self.invalidate_all_sharers(line, &event.rqstr, replay, ctx);
                    line.set_state(if state == Shared { SInv } else { SMInv });
                    return Stall;
                }
                self.send_ack_inv(event, ctx);
                line.set_state(if state == Shared { Invalid } else { IM });
                Done
            }
            SInv => Block,
            SI => {
                // the eviction's acknowledgements now answer the Inv
                line.set_state(SInv);
                Stall
            }
            SMInv => Stall,
            SB => {
                line.set_state(SBInv);
                Block
            }
            SBInv => Block,
            // the flush carried our copy below
            IB => Ignore,
            _ => self.fatal(ctx.now, "Inv in unhandled state", event, state),
        }
    }

    pub(super) fn handle_fetch_inv(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            IS | IM | IB => Ignore,
            Shared | SM => {
                if !line.is_shareless() {
                    self.invalidate_all_sharers(line, &event.rqstr, replay, ctx);
                    line.set_state(if state == Shared { SInv } else { SMInv });
                    return Stall;
                }
                self.respond_down(event, line, false, replay, ctx);
                line.set_state(if state == Shared { Invalid } else { IM });
                Done
            }
            Exclusive | Modified => {
                let next = if state == Exclusive { EInv } else { MInv };
                if line.has_owner() {
                    self.fetch_from_owner(line, &event.rqstr, false, replay, ctx);
                    line.set_state(next);
                    return Stall;
                }
                if !line.is_shareless() {
                    self.invalidate_all_sharers(line, &event.rqstr, replay, ctx);
                    line.set_state(next);
                    return Stall;
                }
                self.respond_down(event, line, state == Modified, replay, ctx);
                line.set_state(Invalid);
                Done
            }
            SI => {
                line.set_state(SInv);
                Stall
            }
            EI => {
                line.set_state(EInv);
                Stall
            }
            MI => {
                line.set_state(MInv);
                Stall
            }
            SMInv => Stall,
            SInv | EInv | MInv | EInvX | MInvX => Block,
            SB => {
                line.set_state(SBInv);
                Block
            }
            SBInv => Block,
            _ => self.fatal(ctx.now, "FetchInv in unhandled state", event, state),
        }
    }

    pub(super) fn handle_fetch_inv_x(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            IS | IM | IB => Ignore,
            Exclusive | Modified => {
                if line.has_owner() {
                    self.fetch_from_owner(line, &event.rqstr, true, replay, ctx);
                    line.set_state(if state == Exclusive { EInvX } else { MInvX });
                    return Stall;
                }
                self.respond_down(event, line, state == Modified, replay, ctx);
                line.set_state(Shared);
                Done
            }
            EI | MI | EInv | MInv | EInvX | MInvX => Block,
            // the flush already sent our data below
            SB | SBInv => {
                self.respond_down(event, line, false, replay, ctx);
                Done
            }
            _ => self.fatal(ctx.now, "FetchInvX in unhandled state", event, state),
        }
    }

    pub(super) fn handle_fetch(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            IS | IM | IB => Ignore,
            Shared | SM | SB | SBInv => {
                self.respond_down(event, line, false, replay, ctx);
                Done
            }
            SInv | SI => Block,
            _ => self.fatal(ctx.now, "Fetch in unhandled state", event, state),
        }
    }
}
