use super::CacheAction::{self, *};
use super::{state_of, CoherenceEngine, EngineCtx};
use crate::mesi::event::{Command, ProtocolEvent};
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    /// GetSResp and GetXResp from below.
    pub(super) fn handle_data_response(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = state_of(line.as_deref());
        let req = self.waiting(parked, ctx.now, event, state);
        if !req.cmd.is_request() {
            self.fatal(ctx.now, "data response while the MSHR front is not a request", event, state);
        }
        let granted = event.granted.unwrap_or(match event.cmd {
            Command::GetXResp => Modified,
            _ => Shared,
        });

        let line = match line {
            Some(line) if line.valid() => line,
            _ if !self.inclusive() => {
                // pass straight through, nothing kept here
                self.respond_up(req, granted, &event.payload, true, 0, ctx);
                return Done;
            }
            _ => self.fatal(ctx.now, "data response for a line that was not requested", event, state),
        };

        match state {
            IS => {
                line.set_data(&event.payload);
                let next = match granted {
                    Exclusive | Modified if self.spec.mesi() || granted == Modified => granted,
                    _ => Shared,
                };
                line.set_state(next);
                if next == Shared {
                    line.add_sharer(&req.src);
                } else {
                    line.set_owner(&req.src);
                }
                self.respond_up_from_line(req, next, line, true, ctx);
                Done
            }
            IM | SM => {
                if state == IM {
                    line.set_data(&event.payload);
                }
                line.set_state(Modified);
                line.set_owner(&req.src);
                self.respond_up_from_line(req, Modified, line, true, ctx);
                Done
            }
            SMInv => {
                // still collecting acknowledgements from the other sharers
                line.set_state(MInv);
                Stall
            }
            _ => self.fatal(ctx.now, "data response in unhandled state", event, state),
        }
    }

    /// FetchResp and FetchXResp from the owner or a sharer.
    pub(super) fn handle_fetch_resp(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        let state = state_of(line.as_deref());
        ctx.take_ack(addr);
        let action = if ctx.acks(addr) == 0 { Done } else { Ignore };

        let line = match line {
            Some(line) if line.valid() => line,
            _ => {
                if self.inclusive() {
                    self.fatal(ctx.now, "fetch response for a line this cache does not hold", event, state);
                }
                if action == Done {
                    let req = self.waiting(parked, ctx.now, event, state);
                    self.respond_down_from(event, req, event.dirty, ctx);
                }
                return action;
            }
        };
        line.set_data(&event.payload);
        if action != Done {
            return action;
        }

        match state {
            EI => {
                let cmd = if event.dirty { Command::PutM } else { Command::PutE };
                line.clear_owner();
                self.writeback_and_retire(cmd, line, event.dirty, ctx);
                Done
            }
            MI => {
                line.clear_owner();
                self.writeback_and_retire(Command::PutM, line, true, ctx);
                Done
            }
            EInvX | MInvX => {
                let req = self.waiting(parked, ctx.now, event, state);
                line.clear_owner();
                if event.cmd == Command::FetchXResp {
                    line.add_sharer(&event.src);
                }
                self.finish_downgrade(event, req, line, ctx)
            }
            EInv | MInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                line.clear_owner();
                line.remove_sharer(&event.src);
                self.finish_invalidation(req, line, event.dirty, ctx)
            }
            _ => self.fatal(ctx.now, "fetch response in unhandled state", event, state),
        }
    }

    pub(super) fn handle_ack_inv(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        let state = state_of(line.as_deref());
        ctx.take_ack(addr);
        let action = if ctx.acks(addr) == 0 { Done } else { Ignore };

        let line = match line {
            Some(line) if line.valid() => line,
            _ => {
                if action == Done {
                    if self.inclusive() {
                        self.fatal(ctx.now, "invalidation ack for a line this cache does not hold", event, state);
                    }
                    let req = self.waiting(parked, ctx.now, event, state);
                    self.send_ack_inv(req, ctx);
                }
                return action;
            }
        };
        line.remove_sharer(&event.src);
        if action != Done {
            return action;
        }

        match state {
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
            SInv | EInv | MInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                self.finish_invalidation(req, line, false, ctx)
            }
            SMInv => {
                let req = self.waiting(parked, ctx.now, event, state);
                match req.cmd {
                    Command::Inv => {
                        if !line.is_shareless() {
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
                        // the GetX still waits for its data
                        line.set_state(SM);
                        Ignore
                    }
                }
            }
            _ => self.fatal(ctx.now, "AckInv in unhandled state", event, state),
        }
    }
}
