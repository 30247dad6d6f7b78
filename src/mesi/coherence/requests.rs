use log::debug;

use super::CacheAction::{self, *};
use super::{CoherenceEngine, EngineCtx};
use crate::mesi::event::ProtocolEvent;
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    pub(super) fn handle_get_s(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            Invalid => {
                let t = self.forward_down(event, line.timestamp(), ctx);
                line.set_timestamp(t);
                line.set_state(IS);
                Stall
            }
            Shared => {
                line.add_sharer(&event.src);
                self.respond_up_from_line(event, Shared, line, replay, ctx);
                Done
            }
            Exclusive | Modified => {
                if !self.inclusive() {
                    self.respond_up_from_line(event, state, line, replay, ctx);
                    line.set_owner(&event.src);
                    return Done;
                }
                if line.is_shareless() && !line.has_owner() && self.spec.mesi() {
                    line.set_owner(&event.src);
                    self.respond_up_from_line(event, Exclusive, line, replay, ctx);
                    return Done;
                }
                if line.has_owner() {
                    debug!("{}: GetS {} needs downgrade of {:?}", self.name, event.base_addr, line.owner());
                    self.fetch_from_owner(line, &event.rqstr, true, replay, ctx);
                    line.set_state(if state == Exclusive { EInvX } else { MInvX });
                    return Stall;
                }
                line.add_sharer(&event.src);
                self.respond_up_from_line(event, Shared, line, replay, ctx);
                Done
            }
            _ => self.fatal(ctx.now, "GetS to a line in transition", event, state),
        }
    }

    /// GetX and GetSEx.
    pub(super) fn handle_get_x(
        &mut self,
        event: &ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        match state {
            Invalid => {
                let t = self.forward_down(event, line.timestamp(), ctx);
                line.set_timestamp(t);
                line.set_state(IM);
                Stall
            }
            Shared => {
                let t = self.forward_down(event, line.timestamp(), ctx);
                line.set_timestamp(t);
                if self.invalidate_sharers_except(line, &event.src, &event.rqstr, replay, ctx) {
                    line.set_state(SMInv);
                } else {
                    line.set_state(SM);
                }
                Stall
            }
            Exclusive | Modified => {
                line.set_state(Modified);
                if !line.is_shareless() && self.invalidate_sharers_except(line, &event.src, &event.rqstr, replay, ctx) {
                    line.set_state(MInv);
                    return Stall;
                }
                if line.has_owner() && !line.is_owner(&event.src) {
                    self.fetch_from_owner(line, &event.rqstr, false, replay, ctx);
                    line.set_state(MInv);
                    return Stall;
                }
                line.set_owner(&event.src);
                self.respond_up_from_line(event, Modified, line, replay, ctx);
                Done
            }
            // upgrade already on its way
            SM => Stall,
            _ => self.fatal(ctx.now, "GetX to a line in transition", event, state),
        }
    }
}
