//! FlushLine and FlushLineInv.
//!
//! A flush pushes dirty data toward memory. FlushLine leaves every holder
//! with a shared copy; FlushLineInv removes the line from every level. The
//! flush is answered with FlushLineResp only after the level below answered.

use log::debug;

use super::CacheAction::{self, *};
use super::{state_of, CoherenceEngine, EngineCtx};
use crate::mesi::event::{Command, ProtocolEvent};
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    pub(super) fn handle_flush(
        &mut self,
        event: &mut ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let addr = event.base_addr;
        if event.in_progress {
            return Block;
        }
        let line = match line {
            Some(line) if line.valid() || self.inclusive() => line,
            _ => {
                // nothing held here, pass it through
                if ctx.mshr.is_hit(addr) {
                    return Block;
                }
                let dirty = event.dirty;
                self.forward_flush(event, None, dirty, ctx);
                event.in_progress = true;
                return Stall;
            }
        };

        if line.in_transition() {
            let participant = line.is_owner(&event.src) || line.is_sharer(&event.src);
            if event.cmd == Command::FlushLineInv && participant && ctx.acks(addr) > 0 {
                // the flush doubles as the acknowledgement being waited for
                let put = self.flush_as_put(event, line);
                debug!("{}: {} from {} answers pending invalidation of {}", self.name, event.cmd, event.src, addr);
                let action = match put.cmd {
                    Command::PutS => self.handle_put_s(&put, Some(&mut *line), parked, ctx),
                    _ => self.handle_put_m(&put, Some(&mut *line), parked, ctx),
                };
                event.payload.clear();
                event.dirty = false;
                return match action {
                    Done | Stall => Stall,
                    Block | Ignore => Block,
                };
            }
            self.absorb_flush_data(event, line);
            return Block;
        }

        if ctx.mshr.is_hit(addr) {
            self.absorb_flush_data(event, line);
            return Block;
        }

        self.absorb_flush_data(event, line);
        self.release_flush_holder(event, line);
        self.launch_flush(event, line, replay, ctx)
    }

    /// Moves the flush's dirty data into the line, once.
    fn absorb_flush_data(&self, event: &mut ProtocolEvent, line: &mut CacheLine) {
        if !event.dirty || event.payload.is_empty() {
            return;
        }
        line.set_data(&event.payload);
        event.payload.clear();
        event.dirty = false;
        let upgraded = match line.state() {
            Exclusive => Modified,
            EInv => MInv,
            EInvX => MInvX,
            EI => MI,
            s => s,
        };
        line.set_state(upgraded);
    }

    /// On a stable line the flushing cache gives up ownership (FlushLine) or
    /// its copy (FlushLineInv).
    fn release_flush_holder(&self, event: &ProtocolEvent, line: &mut CacheLine) {
        match event.cmd {
            Command::FlushLine => {
                if line.is_owner(&event.src) {
                    line.add_sharer(&event.src);
                }
            }
            _ => {
                if line.is_owner(&event.src) {
                    line.clear_owner();
                }
                line.remove_sharer(&event.src);
            }
        }
    }

    fn flush_as_put(&self, event: &ProtocolEvent, line: &CacheLine) -> ProtocolEvent {
        let cmd = if line.is_sharer(&event.src) {
            Command::PutS
        } else if event.dirty {
            Command::PutM
        } else {
            Command::PutE
        };
        event.as_cmd(cmd)
    }

    /// Stable line, no other work pending: collect the upper copies the flush
    /// needs, or send it below right away.
    fn launch_flush(
        &mut self,
        event: &mut ProtocolEvent,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = line.state();
        let held = matches!(state, Exclusive | Modified);
        event.in_progress = true;
        match event.cmd {
            Command::FlushLine => {
                if held && line.has_owner() {
                    self.fetch_from_owner(line, &event.rqstr, true, replay, ctx);
                    line.set_state(if state == Exclusive { EInvX } else { MInvX });
                    return Stall;
                }
                self.forward_flush(event, Some(&mut *line), state == Modified, ctx);
                line.set_state(if state == Invalid { IB } else { SB });
                Stall
            }
            _ => {
                if state != Invalid && !line.is_shareless() {
                    self.invalidate_all_sharers(line, &event.rqstr, replay, ctx);
                    line.set_state(match state {
                        Exclusive => EInv,
                        Modified => MInv,
                        _ => SInv,
                    });
                    return Stall;
                }
                if held && line.has_owner() {
                    self.fetch_from_owner(line, &event.rqstr, false, replay, ctx);
                    line.set_state(if state == Exclusive { EInv } else { MInv });
                    return Stall;
                }
                self.forward_flush(event, Some(&mut *line), state == Modified, ctx);
                line.set_state(IB);
                Stall
            }
        }
    }

    /// The level below finished the flush.
    pub(super) fn handle_flush_resp(
        &mut self,
        event: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        parked: Option<&ProtocolEvent>,
        ctx: &mut EngineCtx,
    ) -> CacheAction {
        let state = state_of(line.as_deref());
        let flush = self.waiting(parked, ctx.now, event, state);
        if !flush.cmd.is_flush() {
            self.fatal(ctx.now, "flush response without a waiting flush", event, state);
        }
        if let Some(line) = line {
            match line.state() {
                IB | Invalid => line.set_state(Invalid),
                SB | SBInv => line.set_state(Shared),
                _ => self.fatal(ctx.now, "flush response in unhandled state", event, state),
            }
        }
        self.send_flush_response(flush, ctx);
        Done
    }
}
