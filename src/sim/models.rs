// asynchronix wrappers around the controller and its neighbours. Every model
// counts cycles on its own tick input; messages go out on the tick they are
// due (controller) or after a fixed latency (memory).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asynchronix::model::{Model, Output};
use asynchronix::time::Scheduler;
use log::{trace, warn};

use super::agents::{Memory, PeerCache, PeerStats};
use crate::mesi::{CacheController, Direction, ProtocolEvent};

// Controller model
pub struct CacheModel {
    cache: CacheController,
    pub o_up: HashMap<String, Output<ProtocolEvent>>,
    pub o_down: Output<ProtocolEvent>,
    cycle: u64,
    idle: Arc<AtomicBool>,
}

impl Model for CacheModel {}

impl CacheModel {
    pub fn new(cache: CacheController, idle: Arc<AtomicBool>) -> Self {
        CacheModel { cache, o_up: HashMap::new(), o_down: Output::new(), cycle: 0, idle }
    }
    /// Output towards the upper component `name`, created on first use.
    pub fn up(&mut self, name: &str) -> &mut Output<ProtocolEvent> {
        self.o_up.entry(name.to_string()).or_insert_with(Output::new)
    }
    async fn send_ready(&mut self) {
        for (dir, ev) in self.cache.drain_outgoing() {
            match dir {
                Direction::Up => match self.o_up.get_mut(&ev.dst) {
                    Some(out) => out.send(ev).await,
                    None => warn!("{}: nobody above named {:?} for {}", self.cache.name(), ev.dst, ev),
                },
                Direction::Down => self.o_down.send(ev).await,
            }
        }
    }
    // clock
    pub async fn on_tick(&mut self, _: ()) {
        self.cycle += 1;
        self.cache.set_clock(self.cycle);
        self.send_ready().await;
    }
    pub async fn on_post_tick(&mut self) {
        self.idle.store(self.cache.is_idle(), Ordering::Relaxed);
    }
    // messages from above and below
    pub async fn on_event(&mut self, ev: ProtocolEvent) {
        self.idle.store(false, Ordering::Relaxed);
        self.cache.submit(ev);
    }
}

// Peer model
pub struct PeerModel {
    peer: PeerCache,
    pub o_down: Output<ProtocolEvent>,
    cycle: u64,
    done: Arc<AtomicBool>,
    report: Arc<Mutex<PeerStats>>,
}

impl Model for PeerModel {}

impl PeerModel {
    pub fn new(peer: PeerCache, done: Arc<AtomicBool>, report: Arc<Mutex<PeerStats>>) -> Self {
        PeerModel { peer, o_down: Output::new(), cycle: 0, done, report }
    }
    async fn send_all(&mut self, events: Vec<ProtocolEvent>) {
        for ev in events {
            trace!("{}: t={} send {}", self.peer.name(), self.cycle, ev);
            self.o_down.send(ev).await;
        }
    }
    pub async fn on_tick(&mut self, _: ()) {
        self.cycle += 1;
        let out = self.peer.tick(self.cycle);
        self.send_all(out).await;
    }
    pub async fn on_post_tick(&mut self) {
        self.done.store(self.peer.is_done(), Ordering::Relaxed);
        if let Ok(mut report) = self.report.lock() {
            *report = self.peer.stats.clone();
        }
    }
    pub async fn on_event(&mut self, ev: ProtocolEvent) {
        let out = self.peer.handle(ev, self.cycle);
        self.send_all(out).await;
    }
}

// Memory model
pub struct MemoryModel {
    mem: Memory,
    latency: u64,
    in_flight: usize,
    pub o_up: Output<ProtocolEvent>,
    idle: Arc<AtomicBool>,
}

impl Model for MemoryModel {}

impl MemoryModel {
    pub fn new(mem: Memory, latency: u64, idle: Arc<AtomicBool>) -> Self {
        MemoryModel { mem, latency: latency.max(1), in_flight: 0, o_up: Output::new(), idle }
    }
    async fn send_up(&mut self, ev: ProtocolEvent) {
        self.in_flight -= 1;
        self.o_up.send(ev).await;
    }
    pub async fn on_post_tick(&mut self) {
        self.idle.store(self.in_flight == 0, Ordering::Relaxed);
    }
    pub async fn on_event(&mut self, ev: ProtocolEvent, scheduler: &Scheduler<Self>) {
        self.idle.store(false, Ordering::Relaxed);
        for resp in self.mem.handle(ev) {
            let what = resp.to_string();
            match scheduler.schedule_event(Duration::from_secs(self.latency), Self::send_up, resp) {
                Ok(()) => self.in_flight += 1,
                Err(e) => warn!("{}: dropping {}: {:?}", self.mem.name(), what, e),
            }
        }
    }
}
