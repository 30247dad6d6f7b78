use log::trace;

use super::CacheAction::{self, *};
use super::{CoherenceEngine, EngineCtx};
use crate::mesi::event::{Command, ProtocolEvent};
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    pub(super) fn handle_put_s(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        let Some(line) = line else {
            return self.put_without_line(event, parked, ctx);
        };

        if !self.inclusive() {
            line.set_data(&event.payload);
            if line.state() == Invalid {
                let next = match parked {
                    _ if ctx.acks(addr) == 0 => Shared,
                    Some(req) if req.cmd == Command::Fetch => SD,
                    _ => SInv,
                };
                line.set_state(next);
            }
        }

        ctx.take_ack(addr);
        line.remove_sharer(&event.src);
        if ctx.acks(addr) != 0 {
            // more acknowledgements outstanding
            return Ignore;
        }

        let state = line.state();
        match state {
            Invalid | Shared | Exclusive | Modified => {
                if !self.inclusive() {
                    self.send_writeback_ack(event, ctx);
                }
                Done
            }
            // a sharer left while the line waits on something else
            SM | SB | SBInv | IB => {
                if !self.inclusive() {
                    self.send_writeback_ack(event, ctx);
                }
                Ignore
            }
            SI => {
                self.writeback_and_retire(Command::PutS, line, false, ctx);
                Done
            }
            EI => {
                self.writeback_and_retire(Command::PutE, line, false, ctx);
                Done
            }
            MI => {
                self.writeback_and_retire(Command::PutM, line, true, ctx);
                Done
            }
            SD => {
                let req = self.waiting(parked, ctx.now, event, state);
                self.respond_down(req, line, false, true, ctx);
                line.set_state(Shared);
                Done
            }
            SInv | EInv | MInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                self.finish_invalidation(req, line, false, ctx)
            }
            SMInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                match req.cmd {
                    Command::Inv => {
                        if line.num_sharers() > 0 {
                            self.invalidate_all_sharers(line, &req.rqstr, true, ctx);
                            return Ignore;
                        }
                        self.send_ack_inv(req, ctx);
                        line.set_state(IM);
                        Done
                    }
                    Command::FetchInv => {
                        self.respond_down(req, line, false, true, ctx);
                        line.set_state(IM);
                        Done
                    }
                    _ => {
                        // still waiting for the GetXResp
                        line.set_state(SM);
                        Ignore
                    }
                }
            }
            _ => self.fatal(ctx.now, "PutS in unhandled state", event, state),
        }
    }

    /// PutE and PutM.
    pub(super) fn handle_put_m(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        let Some(line) = line else {
            return self.put_without_line(event, parked, ctx);
        };

        if !self.inclusive() && line.state() == Invalid {
            let modified = event.cmd == Command::PutM;
            let next = match parked {
                _ if ctx.acks(addr) == 0 => if modified { Modified } else { Exclusive },
                Some(req) if req.cmd == Command::FetchInvX => if modified { MInvX } else { EInvX },
                _ => if modified { MInv } else { EInv },
            };
            line.set_state(next);
        }
        if event.dirty || !self.inclusive() {
            line.set_data(&event.payload);
        }
        ctx.take_ack(addr);

        let state = line.state();
        match state {
            Exclusive | Modified => {
                if state == Exclusive && event.dirty {
                    line.set_state(Modified);
                }
                line.clear_owner();
                if !self.inclusive() {
                    self.send_writeback_ack(event, ctx);
                }
                Done
            }
            SB | SBInv | IB => {
                line.clear_owner();
                if !self.inclusive() {
                    self.send_writeback_ack(event, ctx);
                }
                Ignore
            }
            EI => {
                if event.dirty {
                    self.writeback_and_retire(Command::PutM, line, true, ctx);
                } else {
                    self.writeback_and_retire(Command::PutE, line, false, ctx);
                }
                Done
            }
            MI => {
                self.writeback_and_retire(Command::PutM, line, true, ctx);
                Done
            }
            EInv | MInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                line.clear_owner();
                self.finish_invalidation(req, line, event.dirty, ctx)
            }
            EInvX | MInvX => {
                let req = self.waiting(parked, ctx.now, event, state);
                self.finish_downgrade(event, req, line, ctx)
            }
            _ => self.fatal(ctx.now, "PutE/PutM in unhandled state", event, state),
        }
    }

    /// A writeback reached a non-inclusive cache that could not allocate a
    /// line for it while a probe of the same address is outstanding. The
    /// writeback's data answers the probe directly.
    fn put_without_line(
        &mut self,
        event: &ProtocolEvent,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        if self.inclusive() {
            self.fatal(ctx.now, "writeback for a line this inclusive cache does not hold", event, Invalid);
        }
        let addr = event.base_addr;
        ctx.take_ack(addr);
        let req = self.waiting(parked, ctx.now, event, Invalid);
        trace!("{}: {} for {} resolves {} without a line", self.name, event.cmd, addr, req.cmd);
        match req.cmd {
            Command::Fetch | Command::FetchInvX => {
                self.respond_down_from(event, req, event.dirty, ctx);
                // keep the writeback until a line frees up
                Stall
            }
            Command::FetchInv => {
                self.respond_down_from(event, req, event.dirty, ctx);
                self.send_writeback_ack(event, ctx);
                Done
            }
            Command::Inv => {
                self.send_ack_inv(req, ctx);
                Stall
            }
            _ => self.fatal(ctx.now, "writeback without a line raced with an unhandled event", req, Invalid),
        }
    }

    /// All upper copies are gone: resolve the event that started the
    /// invalidation. `dirty` says whether the last copy came back modified.
    pub(super) fn finish_invalidation(
        &mut self,
        req: &ProtocolEvent,
        line: &mut CacheLine,
        dirty: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        let modified = dirty || state == MInv;
        match req.cmd {
            Command::Inv => {
                self.send_ack_inv(req, ctx);
                line.set_state(Invalid);
                Done
            }
            Command::FetchInv => {
                self.respond_down(req, line, modified, true, ctx);
                line.set_state(Invalid);
                Done
            }
            Command::GetX | Command::GetSEx if state == MInv => {
                line.set_owner(&req.src);
                self.respond_up_from_line(req, Modified, line, true, ctx);
                line.set_state(Modified);
                Done
            }
            Command::FlushLineInv => {
                self.forward_flush(req, Some(&mut *line), modified, ctx);
                line.set_state(IB);
                // the flush stays parked until the level below answers
                Ignore
            }
            _ => self.fatal(ctx.now, "invalidation finished for an unhandled event", req, state),
        }
    }

    /// The owner's copy came back during a downgrade: merge and resolve the
    /// event that asked for it.
    pub(super) fn finish_downgrade(
        &mut self,
        incoming: &ProtocolEvent,
        req: &ProtocolEvent,
        line: &mut CacheLine,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let modified = incoming.dirty || line.state() == MInvX;
        line.set_state(if modified { Modified } else { Exclusive });
        line.clear_owner();
        match req.cmd {
            Command::FetchInvX => {
                self.respond_down(req, line, modified, true, ctx);
                line.set_state(Shared);
                Done
            }
            Command::GetS => {
                if !self.inclusive() {
                    let granted = line.state();
                    self.respond_up_from_line(req, granted, line, true, ctx);
                    line.set_owner(&req.src);
                } else if self.spec.mesi() && line.is_shareless() {
                    line.set_owner(&req.src);
                    self.respond_up_from_line(req, Exclusive, line, true, ctx);
                } else {
                    line.add_sharer(&req.src);
                    self.respond_up_from_line(req, Shared, line, true, ctx);
                }
                Done
            }
            Command::FlushLine => {
                self.forward_flush(req, Some(&mut *line), modified, ctx);
                line.set_state(SB);
                Ignore
            }
            _ => self.fatal(ctx.now, "downgrade finished for an unhandled event", req, line.state()),
        }
    }
}
