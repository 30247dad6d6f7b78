use cachesim_coherence::mesi::{Addr, CacheSpec, Inclusion, Protocol};
use cachesim_coherence::sim::{self, Op, SystemSpec};
use env_logger::Env;
use log::error;

const CACHE: CacheSpec = CacheSpec {
    protocol: Protocol::Mesi,
    inclusion: Inclusion::Inclusive,
    expect_writeback_ack: true,
    silent_evict_clean: false,
    writeback_clean_data: false,
    line_size: 64,
    num_lines: 64,
    assoc: 2,
    mshr_entries: 8,
    tag_latency: 1,
    access_latency: 4,
    mshr_latency: 1,
};
const SYSTEM: SystemSpec = SystemSpec {
    cache: CACHE,
    mem_latency: 100,
    max_cycles: 100_000,
};

fn main() {
    // logging
    let env = Env::default()
        .filter_or("MY_LOG_LEVEL", "trace")
        .write_style_or("MY_LOG_STYLE", "always");
    env_logger::init_from_env(env);

    // load operations
    let traces = vec![
        vec![Op::Read(Addr(0)), Op::Write(Addr(0), 1), Op::Read(Addr(0x40)), Op::Flush(Addr(0))],
        vec![Op::Read(Addr(0)), Op::Read(Addr(0x40)), Op::Write(Addr(0x40), 2)],
        vec![Op::Write(Addr(0x80), 3), Op::Evict(Addr(0x80)), Op::Read(Addr(0))],
        vec![Op::Read(Addr(0x80)), Op::FlushInv(Addr(0x40)), Op::Read(Addr(0))],
    ];

    // run simulation
    match sim::run_system(SYSTEM, traces) {
        Ok(report) => {
            println!("finished simulation in {} cycles", report.cycles);
            for (i, p) in report.peers.iter().enumerate() {
                println!("{}: {} hits, {} misses, {} NACKs, {} probes", sim::peer_name(i), p.hits, p.misses, p.nacks, p.probes);
            }
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
