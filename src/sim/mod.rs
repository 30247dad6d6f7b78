// Drives one controller with private peers above it and memory below it.

mod agents;
mod models;

pub use agents::*;
pub use models::*;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use asynchronix::simulation::{Mailbox, SimInit};
use asynchronix::time::MonotonicTime;
use log::info;

use crate::mesi::{CacheController, CacheSpec, ConfigError, EventIds};

#[derive(Clone, Copy, Debug)]
pub struct SystemSpec {         // unit         reasonable defaults
    pub cache: CacheSpec,       // -            CacheSpec::default()
    pub mem_latency: u64,       // cycles       100
    pub max_cycles: u64,        // cycles       100000
}

impl Default for SystemSpec {
    fn default() -> Self {
        SystemSpec { cache: CacheSpec::default(), mem_latency: 100, max_cycles: 100_000 }
    }
}

pub const CACHE_NAME: &str = "l2";
pub const MEMORY_NAME: &str = "mem";

pub fn peer_name(i: usize) -> String {
    format!("l1.{}", i)
}

#[derive(Clone, Debug)]
pub struct Report {
    pub cycles: u64,
    pub peers: Vec<PeerStats>,
}

#[derive(Debug)]
pub enum SimError {
    Config(ConfigError),
    Timeout { cycles: u64 },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Config(e) => write!(f, "invalid configuration: {}", e),
            SimError::Timeout { cycles } => write!(f, "system still busy after {} cycles", cycles),
        }
    }
}

impl std::error::Error for SimError {}

impl From<ConfigError> for SimError {
    fn from(e: ConfigError) -> Self {
        SimError::Config(e)
    }
}

/// Runs one operation trace per peer to completion.
pub fn run_system(spec: SystemSpec, traces: Vec<Vec<Op>>) -> Result<Report, SimError> {
    let n = traces.len();
    let names = (0..n).map(peer_name).collect::<Vec<_>>();

    // create models
    let controller = CacheController::new(
        CACHE_NAME,
        spec.cache,
        names.clone(),
        vec![MEMORY_NAME.to_string()],
        EventIds::new(0),
    )?;
    let cache_idle = Arc::new(AtomicBool::new(true));
    let mem_idle = Arc::new(AtomicBool::new(true));
    let done = (0..n).map(|_| Arc::new(AtomicBool::new(false))).collect::<Vec<_>>();
    let reports = (0..n).map(|_| Arc::new(Mutex::new(PeerStats::default()))).collect::<Vec<_>>();

    let mut cache = CacheModel::new(controller, cache_idle.clone());
    let mut mem = MemoryModel::new(
        Memory::new(MEMORY_NAME, spec.cache, EventIds::new(u32::MAX)),
        spec.mem_latency,
        mem_idle.clone(),
    );
    let mut peers = traces
        .into_iter()
        .enumerate()
        .map(|(i, ops)| {
            let peer = PeerCache::new(&names[i], CACHE_NAME, spec.cache.line_size, ops, EventIds::new(i as u32 + 1));
            PeerModel::new(peer, done[i].clone(), reports[i].clone())
        })
        .collect::<Vec<_>>();

    // create mailboxes
    let cache_mbox = Mailbox::<CacheModel>::new();
    let mem_mbox = Mailbox::<MemoryModel>::new();
    let mut peer_mbox = peers.iter().map(|_| Mailbox::<PeerModel>::new()).collect::<Vec<_>>();

    // addresses
    let cache_addr = cache_mbox.address();
    let mem_addr = mem_mbox.address();
    let peer_addr = peer_mbox.iter().map(|mb| mb.address()).collect::<Vec<_>>();

    // connect models
    for i in 0..n {
        peers[i].o_down.connect(CacheModel::on_event, &cache_mbox);
        cache.up(&names[i]).connect(PeerModel::on_event, &peer_mbox[i]);
    }
    cache.o_down.connect(MemoryModel::on_event, &mem_mbox);
    mem.o_up.connect(CacheModel::on_event, &cache_mbox);

    // initialize simulation
    let mut simi = SimInit::new().add_model(cache, cache_mbox).add_model(mem, mem_mbox);
    for _ in 0..n {
        simi = simi.add_model(peers.remove(0), peer_mbox.remove(0));
    }
    let mut sim = simi.init(MonotonicTime::EPOCH);

    // run simulation
    let mut cycles = 0;
    loop {
        if done.iter().all(|d| d.load(Ordering::Relaxed))
            && cache_idle.load(Ordering::Relaxed)
            && mem_idle.load(Ordering::Relaxed)
        {
            break;
        }
        if cycles >= spec.max_cycles {
            return Err(SimError::Timeout { cycles });
        }

        // tick
        sim.send_event(CacheModel::on_tick, (), &cache_addr);
        for addr in &peer_addr {
            sim.send_event(PeerModel::on_tick, (), addr);
        }

        sim.step_by(Duration::from_secs(1));

        // post-tick
        sim.send_event(CacheModel::on_post_tick, (), &cache_addr);
        sim.send_event(MemoryModel::on_post_tick, (), &mem_addr);
        for addr in &peer_addr {
            sim.send_event(PeerModel::on_post_tick, (), addr);
        }

        cycles += 1;
    }

    info!("finished simulation in {} cycles", cycles);
    let peers = reports
        .iter()
        .map(|r| r.lock().map(|s| s.clone()).unwrap_or_default())
        .collect();
    Ok(Report { cycles, peers })
}
