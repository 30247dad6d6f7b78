use log::debug;

use super::CacheAction::{self, *};
use super::{CoherenceEngine, EngineCtx};
use crate::mesi::event::Command;
use crate::mesi::line::{CacheLine, LineState::*};

impl CoherenceEngine {
    /// Evicts a replacement victim. `Stall` means upper copies must be
    /// collected first; the controller retries the allocation afterwards.
    pub fn handle_eviction(&mut self, line: &mut CacheLine, ctx: &mut EngineCtx) -> CacheAction {
        let state = line.state();
        let addr = line.base_addr();
        let name = self.name.clone();
        debug!("{}: evicting {}", self.name, line);
        match state {
            Invalid => Done,
            Shared => {
                if !line.is_shareless() {
                    if !self.inclusive() {
                        line.set_state(Invalid);
                        return Done;
                    }
                    self.invalidate_all_sharers(line, &name, false, ctx);
                    line.set_state(SI);
                    return Stall;
                }
                self.retire_clean(Command::PutS, line, ctx)
            }
            Exclusive | Modified => {
                let collecting = if state == Exclusive { EI } else { MI };
                if !self.inclusive() && line.has_owner() {
                    line.set_state(Invalid);
                    return Done;
                }
                if !line.is_shareless() {
                    self.invalidate_all_sharers(line, &name, false, ctx);
                    line.set_state(collecting);
                    return Stall;
                }
                if line.has_owner() {
                    self.fetch_from_owner(line, &name, false, false, ctx);
                    line.set_state(collecting);
                    return Stall;
                }
                if state == Exclusive {
                    self.retire_clean(Command::PutE, line, ctx)
                } else {
                    self.writeback_and_retire(Command::PutM, line, true, ctx);
                    Done
                }
            }
            _ => {
                debug!("{}: victim {} busy in {}", self.name, addr, state);
                Stall
            }
        }
    }

    fn retire_clean(&mut self, cmd: Command, line: &mut CacheLine, ctx: &mut EngineCtx) -> CacheAction {
        if self.spec.silent_evict_clean {
            line.set_state(Invalid);
        } else {
            self.writeback_and_retire(cmd, line, false, ctx);
        }
        Done
    }
}
