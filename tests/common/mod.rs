// Synchronous message-passing world: one controller named "l2", peers
// "l1.<i>" above it and memory "mem" below. Every link is FIFO.

#![allow(dead_code)]

use std::collections::VecDeque;

use cachesim_coherence::mesi::{Addr, CacheController, CacheSpec, EventIds, LineState, ProtocolEvent};
use cachesim_coherence::sim::{peer_name, Memory, Op, PeerCache, CACHE_NAME, MEMORY_NAME};

pub const LINE: u64 = 64;

pub fn small_spec() -> CacheSpec {
    CacheSpec {
        line_size: LINE,
        num_lines: 8,
        assoc: 2,
        mshr_entries: 8,
        ..CacheSpec::default()
    }
}

pub struct World {
    pub now: u64,
    pub l2: CacheController,
    pub peers: Vec<PeerCache>,
    pub mem: Memory,
    pub mem_latency: u64,
    wire: VecDeque<(u64, ProtocolEvent)>,
    /// every message the controller sent, in order
    pub sent: Vec<ProtocolEvent>,
}

impl World {
    pub fn new(spec: CacheSpec, peers: usize) -> Self {
        Self::with_traces(spec, vec![Vec::new(); peers])
    }

    pub fn with_traces(spec: CacheSpec, traces: Vec<Vec<Op>>) -> Self {
        let names = (0..traces.len()).map(peer_name).collect::<Vec<_>>();
        let l2 = CacheController::new(CACHE_NAME, spec, names.clone(), vec![MEMORY_NAME.to_string()], EventIds::new(0))
            .expect("valid spec");
        let peers = traces
            .into_iter()
            .enumerate()
            .map(|(i, ops)| PeerCache::new(&names[i], CACHE_NAME, spec.line_size, ops, EventIds::new(i as u32 + 1)))
            .collect();
        World {
            now: 0,
            l2,
            peers,
            mem: Memory::new(MEMORY_NAME, spec, EventIds::new(u32::MAX)),
            mem_latency: 3,
            wire: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    pub fn push_op(&mut self, peer: usize, op: Op) {
        self.peers[peer].push_op(op);
    }

    fn send(&mut self, ev: ProtocolEvent, delay: u64) {
        let at = self.now + delay;
        // links are FIFO: never arrive before something sent earlier
        let at = self.wire.back().map_or(at, |(last, _)| at.max(*last));
        self.wire.push_back((at, ev));
    }

    fn deliver(&mut self, ev: ProtocolEvent) {
        if ev.dst == CACHE_NAME {
            self.l2.submit(ev);
        } else if ev.dst == MEMORY_NAME {
            for resp in self.mem.handle(ev) {
                let lat = self.mem_latency;
                self.send(resp, lat);
            }
        } else {
            let i = match self.peers.iter().position(|p| p.name() == ev.dst) {
                Some(i) => i,
                None => panic!("no component named {:?} for {}", ev.dst, ev),
            };
            let now = self.now;
            for resp in self.peers[i].handle(ev, now) {
                self.send(resp, 1);
            }
        }
    }

    /// Hands an event straight to the controller, outside of any peer.
    pub fn inject(&mut self, ev: ProtocolEvent) {
        self.l2.set_clock(self.now);
        self.l2.submit(ev);
    }

    pub fn step(&mut self) {
        self.now += 1;
        self.l2.set_clock(self.now);
        while matches!(self.wire.front(), Some((at, _)) if *at <= self.now) {
            if let Some((_, ev)) = self.wire.pop_front() {
                self.deliver(ev);
            }
        }
        for i in 0..self.peers.len() {
            let now = self.now;
            for ev in self.peers[i].tick(now) {
                self.send(ev, 1);
            }
        }
        for (_, ev) in self.l2.drain_outgoing() {
            self.sent.push(ev.clone());
            self.send(ev, 1);
        }
    }

    pub fn quiet(&self) -> bool {
        self.wire.is_empty() && self.l2.is_idle() && self.peers.iter().all(|p| p.is_done())
    }

    /// Steps until nothing moves any more. Panics past `max` cycles.
    pub fn run(&mut self, max: u64) -> u64 {
        let start = self.now;
        while !self.quiet() {
            if self.now - start > max {
                let waiting = self.peers.iter().filter(|p| p.is_waiting()).map(|p| p.name()).collect::<Vec<_>>();
                panic!(
                    "system still busy after {} cycles, MSHR holds {}, waiting {:?}",
                    max,
                    self.l2.mshr().size(),
                    waiting
                );
            }
            self.step();
            self.check_exclusion();
        }
        self.now - start
    }

    pub fn l2_state(&self, addr: u64) -> LineState {
        self.l2.line(Addr(addr)).map_or(LineState::Invalid, |l| l.state())
    }
    pub fn peer_state(&self, peer: usize, addr: u64) -> LineState {
        self.peers[peer].state(Addr(addr))
    }

    /// Every line in the controller keeps owner and sharers apart, and no two
    /// peers hold a line while one of them may write it.
    pub fn check_exclusion(&self) {
        let mut addrs = Vec::new();
        for p in &self.peers {
            for a in (0..16).map(|i| i * LINE) {
                if p.state(Addr(a)) != LineState::Invalid && !addrs.contains(&a) {
                    addrs.push(a);
                }
            }
        }
        for a in addrs {
            let states = self.peers.iter().map(|p| p.state(Addr(a))).collect::<Vec<_>>();
            let writers = states.iter().filter(|s| matches!(s, LineState::Exclusive | LineState::Modified)).count();
            let holders = states.iter().filter(|s| **s != LineState::Invalid).count();
            assert!(writers <= 1, "t={} {:#x}: several writers {:?}", self.now, a, states);
            assert!(writers == 0 || holders == 1, "t={} {:#x}: writer with other copies {:?}", self.now, a, states);
            if let Some(line) = self.l2.line(Addr(a)) {
                assert!(line.check_invariants(), "t={} {:#x}: {}", self.now, a, line);
            }
        }
    }

    pub fn sent_cmds(&self) -> Vec<(cachesim_coherence::mesi::Command, String)> {
        self.sent.iter().map(|e| (e.cmd, e.dst.clone())).collect()
    }
}
