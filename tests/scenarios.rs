mod common;

use cachesim_coherence::mesi::*;
use cachesim_coherence::sim::Op;
use common::*;

const A: Addr = Addr(0x40);

fn engine(spec: CacheSpec) -> CoherenceEngine {
    CoherenceEngine::new("l2", spec, vec!["p1".into(), "p2".into()], vec!["mem".into()])
}

fn event(cmd: Command, src: &str) -> ProtocolEvent {
    ProtocolEvent::new(EventIds::new(7).next(), cmd, A, src).with_dst("l2")
}

fn queued(eng: &CoherenceEngine) -> Vec<(Direction, Command, String)> {
    eng.pending().map(|(d, r)| (d, r.event.cmd, r.event.dst.clone())).collect()
}

#[test]
fn get_x_on_invalid_line_fetches_below() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    let get = event(Command::GetX, "p1");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_request(&get, &mut line, false, &mut ctx), CacheAction::Stall);
    assert_eq!(line.state(), LineState::IM);
    assert_eq!(queued(&eng), vec![(Direction::Down, Command::GetX, "mem".to_string())]);

    let (_, fwd) = eng.drain_ready(100).remove(0);
    assert_eq!(fwd.id, get.id);
    let mut resp = fwd.make_response(EventIds::new(9).next(), "mem");
    resp.granted = Some(LineState::Modified);
    resp.payload = vec![1; 64];

    let mut ctx = EngineCtx::new(100, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&resp, Some(&mut line), Some(&get), &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Modified);
    assert_eq!(line.owner(), Some("p1"));
    assert_eq!(queued(&eng), vec![(Direction::Up, Command::GetXResp, "p1".to_string())]);
}

#[test]
fn upgrade_invalidates_other_sharers_only() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Shared);
    line.add_sharer("p1");
    line.add_sharer("p2");
    let get = event(Command::GetX, "p1");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_request(&get, &mut line, false, &mut ctx), CacheAction::Stall);
    assert_eq!(line.state(), LineState::SMInv);
    assert_eq!(mshr.acks_needed(A), 1);
    let out = eng.drain_ready(100);
    let invs = out.iter().filter(|(_, e)| e.cmd == Command::Inv).collect::<Vec<_>>();
    assert_eq!(invs.len(), 1);
    assert_eq!(invs[0].1.dst, "p2");
    let fwd = out.iter().find(|(d, _)| *d == Direction::Down).map(|(_, e)| e.clone()).unwrap();

    // data first, then the last acknowledgement
    let resp = fwd.make_response(EventIds::new(9).next(), "mem");
    let mut ctx = EngineCtx::new(100, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&resp, Some(&mut line), Some(&get), &mut ctx), CacheAction::Stall);
    assert_eq!(line.state(), LineState::MInv);

    let ack = invs[0].1.make_response(EventIds::new(2).next(), "p2");
    let mut ctx = EngineCtx::new(101, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&ack, Some(&mut line), Some(&get), &mut ctx), CacheAction::Done);
    assert_eq!(mshr.acks_needed(A), 0);
    assert_eq!(line.state(), LineState::Modified);
    assert_eq!(line.owner(), Some("p1"));
    assert!(line.is_shareless());
}

#[test]
fn upgrade_with_ack_before_data() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Shared);
    line.add_sharer("p1");
    line.add_sharer("p2");
    let get = event(Command::GetX, "p1");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    eng.handle_request(&get, &mut line, false, &mut ctx);
    let out = eng.drain_ready(100);
    let inv = out.iter().find(|(_, e)| e.cmd == Command::Inv).map(|(_, e)| e.clone()).unwrap();
    let fwd = out.iter().find(|(_, e)| e.cmd == Command::GetX).map(|(_, e)| e.clone()).unwrap();

    let ack = inv.make_response(EventIds::new(2).next(), "p2");
    let mut ctx = EngineCtx::new(100, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&ack, Some(&mut line), Some(&get), &mut ctx), CacheAction::Ignore);
    assert_eq!(line.state(), LineState::SM);

    let resp = fwd.make_response(EventIds::new(9).next(), "mem");
    let mut ctx = EngineCtx::new(101, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&resp, Some(&mut line), Some(&get), &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Modified);
    assert_eq!(line.owner(), Some("p1"));
}

#[test]
fn fetch_inv_collects_dirty_owner_copy() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Modified);
    line.set_owner("p1");
    let mut probe = ProtocolEvent::new(EventIds::new(9).next(), Command::FetchInv, A, "mem").with_dst("l2");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    let action = eng.handle_invalidation_request(&mut probe, Some(&mut line), None, false, &mut ctx);
    assert_eq!(action, CacheAction::Stall);
    assert_eq!(mshr.acks_needed(A), 1);
    assert_eq!(line.state(), LineState::MInv);
    let (dir, up) = eng.drain_ready(100).remove(0);
    assert_eq!(dir, Direction::Up);
    assert_eq!((up.cmd, up.dst.as_str()), (Command::FetchInv, "p1"));

    let resp = up.make_response(EventIds::new(1).next(), "p1").with_payload(vec![0xab; 64], true);
    let mut ctx = EngineCtx::new(100, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&resp, Some(&mut line), Some(&probe), &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Invalid);
    let (dir, down) = eng.drain_ready(200).remove(0);
    assert_eq!(dir, Direction::Down);
    assert_eq!(down.cmd, Command::FetchResp);
    assert_eq!(down.dst, "mem");
    assert!(down.dirty);
    assert_eq!(down.payload, vec![0xab; 64]);
}

#[test]
fn clean_eviction_waits_for_writeback_ack() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Shared);

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_eviction(&mut line, &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Invalid);
    assert!(mshr.pending_writeback(A));
    let (dir, put) = eng.drain_ready(100).remove(0);
    assert_eq!((dir, put.cmd), (Direction::Down, Command::PutS));
    assert!(!put.dirty);

    // an unrelated response leaves the marker alone
    assert!(mshr.pending_writeback(A));
    let ack = put.make_response(EventIds::new(9).next(), "mem");
    let mut ctx = EngineCtx::new(100, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&ack, Some(&mut line), None, &mut ctx), CacheAction::Done);
    assert!(!mshr.pending_writeback(A));
    assert!(mshr.is_empty());
}

#[test]
fn silent_clean_eviction_sends_nothing() {
    let spec = CacheSpec { silent_evict_clean: true, ..CacheSpec::default() };
    let mut eng = engine(spec);
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Exclusive);

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_eviction(&mut line, &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Invalid);
    assert!(!eng.has_pending());
    assert!(!mshr.pending_writeback(A));
}

#[test]
fn stale_probe_on_inclusive_cache_is_ignored() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut probe = ProtocolEvent::new(EventIds::new(9).next(), Command::Inv, A, "mem");

    for _ in 0..3 {
        let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
        assert_eq!(eng.handle_invalidation_request(&mut probe, None, None, false, &mut ctx), CacheAction::Ignore);
    }
    assert!(!eng.has_pending());
    assert!(mshr.is_empty());
}

#[test]
fn probe_consumes_crossing_writeback() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    mshr.insert_writeback(A);
    let mut probe = ProtocolEvent::new(EventIds::new(9).next(), Command::FetchInv, A, "mem");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_invalidation_request(&mut probe, None, None, false, &mut ctx), CacheAction::Done);
    assert!(!mshr.pending_writeback(A));
}

#[test]
fn downgrade_merges_dirty_flush_into_modified() {
    let mut eng = engine(CacheSpec::default());
    let mut mshr = Mshr::new("l2", 16);
    let mut ids = EventIds::new(0);
    let mut line = CacheLine::new(A, 64);
    line.set_state(LineState::Exclusive);
    line.set_owner("p1");
    let mut probe = ProtocolEvent::new(EventIds::new(9).next(), Command::FetchInvX, A, "mem");

    let mut ctx = EngineCtx::new(0, &mut mshr, &mut ids);
    assert_eq!(eng.handle_invalidation_request(&mut probe, Some(&mut line), None, false, &mut ctx), CacheAction::Stall);
    assert_eq!(line.state(), LineState::EInvX);

    // the owner flushes instead of answering: its dirty data lands here
    let mut flush = event(Command::FlushLine, "p1").with_payload(vec![5; 64], true);
    let mut ctx = EngineCtx::new(1, &mut mshr, &mut ids);
    let action = eng.handle_replacement(&mut flush, Some(&mut line), Some(&probe), false, &mut ctx);
    assert_eq!(action, CacheAction::Block);
    assert_eq!(line.state(), LineState::MInvX);
    assert!(!flush.has_payload());

    let fetch = eng.drain_ready(10).into_iter().find(|(_, e)| e.cmd == Command::FetchInvX).map(|(_, e)| e).unwrap();
    let resp = fetch.make_response(EventIds::new(1).next(), "p1");
    let mut ctx = EngineCtx::new(20, &mut mshr, &mut ids);
    assert_eq!(eng.handle_response(&resp, Some(&mut line), Some(&probe), &mut ctx), CacheAction::Done);
    assert_eq!(line.state(), LineState::Shared);
    assert!(line.is_sharer("p1"));
    let down = eng.drain_ready(100).into_iter().find(|(d, _)| *d == Direction::Down).map(|(_, e)| e).unwrap();
    assert_eq!(down.cmd, Command::FetchXResp);
    assert!(down.dirty);
    assert_eq!(down.payload, vec![5; 64]);
}

#[test]
#[should_panic(expected = "below zero")]
fn ack_underflow_panics() {
    let mut mshr = Mshr::new("l2", 4);
    mshr.decrement_acks_needed(A);
}

fn sent(l2: &mut CacheController, at: u64, dir: Direction, cmd: Command) -> ProtocolEvent {
    l2.set_clock(at);
    match l2.drain_outgoing().into_iter().find(|(d, e)| *d == dir && e.cmd == cmd) {
        Some((_, ev)) => ev,
        None => panic!("t={}: no {} sent {:?}", at, cmd, dir),
    }
}

#[test]
fn parked_flush_inv_stands_in_for_the_invalidation_ack() {
    let spec = CacheSpec { protocol: Protocol::Msi, ..small_spec() };
    let mut l2 = CacheController::new("l2", spec, vec!["p0".into(), "p1".into()], vec!["mem".into()], EventIds::new(0))
        .unwrap();
    let mut ids = EventIds::new(5);

    // p0 reads, p1 wants to write and p0 flushes its copy before the fill returns
    l2.submit(ProtocolEvent::new(ids.next(), Command::GetS, A, "p0").with_dst("l2"));
    l2.submit(ProtocolEvent::new(ids.next(), Command::GetX, A, "p1").with_dst("l2"));
    l2.submit(ProtocolEvent::new(ids.next(), Command::FlushLineInv, A, "p0").with_dst("l2"));
    assert_eq!(l2.mshr().entries(A).count(), 3);

    let get_s = sent(&mut l2, 1000, Direction::Down, Command::GetS);
    let mut fill = get_s.make_response(ids.next(), "mem");
    fill.granted = Some(LineState::Shared);
    fill.payload = vec![0; 64];
    l2.submit(fill);

    // the GetX invalidates p0, whose flush already gave the copy up
    let queued = l2.pending_outgoing().map(|(d, r)| (d, r.event.cmd, r.event.dst.clone())).collect::<Vec<_>>();
    assert!(queued.contains(&(Direction::Up, Command::Inv, "p0".to_string())));
    assert!(queued.contains(&(Direction::Down, Command::GetX, "mem".to_string())));
    assert_eq!(l2.mshr().acks_needed(A), 0);
    let line = l2.line(A).unwrap();
    assert_eq!(line.state(), LineState::SM);
    assert!(!line.is_sharer("p0"));

    let get_x = sent(&mut l2, 2000, Direction::Down, Command::GetX);
    let mut grant = get_x.make_response(ids.next(), "mem");
    grant.granted = Some(LineState::Modified);
    l2.submit(grant);

    // the flush now runs on the new owner's line
    let fetch = sent(&mut l2, 3000, Direction::Up, Command::FetchInv);
    assert_eq!(fetch.dst, "p1");
    let back = fetch.make_response(ids.next(), "p1").with_payload(vec![9; 64], true);
    l2.submit(back);

    let flush = sent(&mut l2, 4000, Direction::Down, Command::FlushLineInv);
    assert!(flush.dirty);
    assert_eq!(flush.payload, vec![9; 64]);
    l2.submit(flush.make_response(ids.next(), "mem"));

    let done = sent(&mut l2, 5000, Direction::Up, Command::FlushLineResp);
    assert_eq!(done.dst, "p0");
    assert!(l2.is_idle());
    assert!(l2.line(A).is_none(), "retired line keeps its slot");
}

// whole-system scenarios

#[test]
fn second_reader_downgrades_exclusive_owner() {
    let mut w = World::new(small_spec(), 2);
    w.push_op(0, Op::Read(Addr(0)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Exclusive);
    assert_eq!(w.l2_state(0), LineState::Exclusive);

    w.push_op(1, Op::Read(Addr(0)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Shared);
    assert_eq!(w.peer_state(1, 0), LineState::Shared);
    let line = w.l2.line(Addr(0)).unwrap();
    assert!(line.is_sharer("l1.0") && line.is_sharer("l1.1"));
    assert!(!line.has_owner());
    assert!(w.sent_cmds().contains(&(Command::FetchInvX, "l1.0".to_string())));
}

#[test]
fn writer_invalidates_readers_and_data_moves() {
    let mut w = World::new(small_spec(), 3);
    w.push_op(0, Op::Read(Addr(0)));
    w.push_op(1, Op::Read(Addr(0)));
    w.run(500);
    w.push_op(2, Op::Write(Addr(3), 42));
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Invalid);
    assert_eq!(w.peer_state(1, 0), LineState::Invalid);
    assert_eq!(w.peer_state(2, 0), LineState::Modified);
    assert_eq!(w.l2.line(Addr(0)).unwrap().owner(), Some("l1.2"));

    w.push_op(0, Op::Read(Addr(3)));
    w.run(500);
    assert_eq!(w.peers[0].stats.reads.last(), Some(&(Addr(3), 42)));
    assert_eq!(w.peer_state(2, 0), LineState::Shared);
    assert_eq!(w.l2_state(0), LineState::Modified);
}

#[test]
fn msi_never_grants_exclusive() {
    let spec = CacheSpec { protocol: Protocol::Msi, ..small_spec() };
    let mut w = World::new(spec, 1);
    w.push_op(0, Op::Read(Addr(0x80)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0x80), LineState::Shared);
    assert_eq!(w.l2_state(0x80), LineState::Shared);
}

#[test]
fn dirty_line_reaches_memory_on_eviction() {
    // two sets of two ways: three lines mapping to set 0 force a victim
    let spec = CacheSpec { num_lines: 4, ..small_spec() };
    let mut w = World::new(spec, 1);
    w.push_op(0, Op::Write(Addr(0), 9));
    w.push_op(0, Op::Read(Addr(0x80)));
    w.push_op(0, Op::Read(Addr(0x100)));
    w.run(1000);
    assert_eq!(w.mem.line(Addr(0))[0], 9);
    assert_eq!(w.peer_state(0, 0), LineState::Invalid);
    assert!(w.sent_cmds().contains(&(Command::FetchInv, "l1.0".to_string())));
    assert!(w.sent_cmds().contains(&(Command::PutM, "mem".to_string())));
}

#[test]
fn peer_writeback_updates_controller_copy() {
    let mut w = World::new(small_spec(), 1);
    w.push_op(0, Op::Write(Addr(0x40), 7));
    w.push_op(0, Op::Evict(Addr(0x40)));
    w.run(500);
    let line = w.l2.line(Addr(0x40)).unwrap();
    assert_eq!(line.state(), LineState::Modified);
    assert!(!line.has_owner());
    assert_eq!(line.data()[0], 7);
}

#[test]
fn flush_pushes_dirty_data_below_and_keeps_copies() {
    let mut w = World::new(small_spec(), 2);
    w.push_op(0, Op::Write(Addr(0), 1));
    w.run(500);
    w.push_op(1, Op::Flush(Addr(0)));
    w.run(500);
    assert_eq!(w.mem.line(Addr(0))[0], 1);
    assert_eq!(w.peer_state(0, 0), LineState::Shared);
    assert_eq!(w.l2_state(0), LineState::Shared);
    assert!(w.peers[1].is_done());
}

#[test]
fn flush_inv_removes_line_everywhere() {
    let mut w = World::new(small_spec(), 2);
    w.push_op(0, Op::Read(Addr(0)));
    w.push_op(1, Op::Read(Addr(0)));
    w.run(500);
    w.push_op(0, Op::Write(Addr(0), 4));
    w.run(500);
    w.push_op(1, Op::FlushInv(Addr(0)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Invalid);
    assert_eq!(w.l2_state(0), LineState::Invalid);
    assert_eq!(w.mem.line(Addr(0))[0], 4);
}

#[test]
fn owner_flush_inv_of_its_own_line() {
    let mut w = World::new(small_spec(), 1);
    w.push_op(0, Op::Write(Addr(0x40), 6));
    w.push_op(0, Op::FlushInv(Addr(0x40)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0x40), LineState::Invalid);
    assert_eq!(w.l2_state(0x40), LineState::Invalid);
    assert_eq!(w.mem.line(Addr(0x40))[0], 6);
}

#[test]
fn non_inclusive_cache_passes_fills_through() {
    let spec = CacheSpec { inclusion: Inclusion::NonInclusive, ..small_spec() };
    let mut w = World::new(spec, 1);
    w.push_op(0, Op::Read(Addr(0)));
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Exclusive);
    assert!(w.l2.line(Addr(0)).map_or(true, |l| !l.valid()));

    // the writeback is what finally allocates here
    w.push_op(0, Op::Write(Addr(0), 2));
    w.push_op(0, Op::Evict(Addr(0)));
    w.run(500);
    let line = w.l2.line(Addr(0)).unwrap();
    assert_eq!(line.state(), LineState::Modified);
    assert_eq!(line.data()[0], 2);
    assert!(w.sent_cmds().contains(&(Command::AckPut, "l1.0".to_string())));

    w.push_op(0, Op::Read(Addr(0)));
    w.run(500);
    assert_eq!(w.peers[0].stats.reads.last(), Some(&(Addr(0), 2)));
}

#[test]
fn non_inclusive_probe_goes_to_the_level_above() {
    let spec = CacheSpec { inclusion: Inclusion::NonInclusive, ..small_spec() };
    let mut w = World::new(spec, 1);
    w.push_op(0, Op::Write(Addr(0), 8));
    w.run(500);

    let probe = ProtocolEvent::new(EventIds::new(77).next(), Command::FetchInv, Addr(0), "mem").with_dst("l2");
    w.inject(probe);
    w.run(500);
    assert_eq!(w.peer_state(0, 0), LineState::Invalid);
    assert!(w.sent_cmds().contains(&(Command::FetchInv, "l1.0".to_string())));
    let resp = w.sent.iter().find(|e| e.cmd == Command::FetchResp).unwrap();
    assert!(resp.dirty);
    assert_eq!(resp.payload[0], 8);
}
