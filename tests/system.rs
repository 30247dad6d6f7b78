use cachesim_coherence::mesi::{Addr, CacheSpec, ConfigError};
use cachesim_coherence::sim::{run_system, Op, SimError, SystemSpec};

fn spec() -> SystemSpec {
    SystemSpec {
        cache: CacheSpec { num_lines: 16, assoc: 2, mshr_entries: 8, ..CacheSpec::default() },
        mem_latency: 10,
        max_cycles: 10_000,
    }
}

#[test]
fn end_to_end_run_completes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let traces = vec![
        vec![Op::Write(Addr(0x40), 7), Op::Read(Addr(0x41)), Op::Read(Addr(0x40))],
        vec![Op::Read(Addr(0x80)), Op::Write(Addr(0x80), 3), Op::Evict(Addr(0x80))],
    ];
    let report = run_system(spec(), traces).expect("simulation finishes");
    assert!(report.cycles > 10);
    assert_eq!(report.peers.len(), 2);
    assert_eq!(report.peers[0].reads, vec![(Addr(0x41), 0), (Addr(0x40), 7)]);
    assert_eq!(report.peers[0].hits, 2);
    assert_eq!(report.peers[1].reads, vec![(Addr(0x80), 0)]);
}

#[test]
fn shared_line_between_peers() {
    let traces = vec![
        vec![Op::Read(Addr(0)), Op::Read(Addr(0x200))],
        vec![Op::Read(Addr(0)), Op::Flush(Addr(0))],
        vec![Op::Write(Addr(0x200), 1), Op::FlushInv(Addr(0x200))],
    ];
    let report = run_system(spec(), traces).expect("simulation finishes");
    assert_eq!(report.peers[0].reads.len(), 2);
    assert!(report.peers.iter().all(|p| p.nacks == 0));
}

#[test]
fn bad_configuration_is_rejected() {
    let mut s = spec();
    s.cache.mshr_entries = 1;
    match run_system(s, vec![vec![Op::Read(Addr(0))]]) {
        Err(SimError::Config(ConfigError::MshrTooSmall(1))) => {}
        other => panic!("unexpected result {:?}", other.map(|r| r.cycles)),
    }
}

#[test]
fn stuck_system_times_out() {
    let mut s = spec();
    s.max_cycles = 5;
    let res = run_system(s, vec![vec![Op::Read(Addr(0))]]);
    assert!(matches!(res, Err(SimError::Timeout { cycles: 5 })));
}
