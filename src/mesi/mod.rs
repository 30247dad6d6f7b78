mod coherence;
mod common;
mod controller;
mod event;
mod line;
mod mshr;
mod outgoing;
mod store;

pub use coherence::{CacheAction, CoherenceEngine, EngineCtx, MissKind};
pub use common::*;
pub use controller::CacheController;
pub use event::{Command, Direction, ProtocolEvent};
pub use line::{CacheLine, LineState};
pub use mshr::{Mshr, MshrEntry};
pub use outgoing::{OutgoingQueue, Response};
pub use store::{LineId, LineStore, SetAssocStore};
