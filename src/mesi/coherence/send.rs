// message construction and queueing

use log::{debug, trace};

use super::{CoherenceEngine, EngineCtx};
use crate::mesi::common::timing::{self, Latency};
use crate::mesi::common::Addr;
use crate::mesi::event::{Command, ProtocolEvent};
use crate::mesi::line::{CacheLine, LineState};

impl CoherenceEngine {
    fn enqueue_up(&mut self, event: ProtocolEvent, delivery: u64) {
        trace!("{}: queue up {} at {}", self.name, event, delivery);
        self.out_up.push(event, delivery);
    }
    fn enqueue_down(&mut self, event: ProtocolEvent, delivery: u64) {
        trace!("{}: queue down {} at {}", self.name, event, delivery);
        self.out_down.push(event, delivery);
    }

    /// Lower-level target for an address: the single next level, or an
    /// interleaved slice of it.
    pub(super) fn destination(&self, addr: Addr) -> String {
        match self.lower.len() {
            0 => String::new(),
            1 => self.lower[0].clone(),
            n => self.lower[(addr.line_number(self.spec.line_size) % n as u64) as usize].clone(),
        }
    }

    pub fn send_nack(&mut self, event: ProtocolEvent, ctx: &mut EngineCtx) {
        let nack = event.make_nack(ctx.ids.next(), &self.name);
        let delivery = self.delivery(ctx, 0, Latency::Tag);
        debug!("{}: NACK {} back to {}", self.name, event, event.src);
        if event.cmd.travels_down() {
            self.enqueue_up(nack, delivery);
        } else {
            self.enqueue_down(nack, delivery);
        }
    }

    /// Sends `event` again after exponential back-off.
    pub fn resend_event(&mut self, mut event: ProtocolEvent, ctx: &mut EngineCtx) {
        let backoff = timing::backoff(&self.spec, event.retries);
        event.retries += 1;
        event.in_mshr = false;
        event.blocked = false;
        let delivery = ctx.now + backoff;
        debug!("{}: resend {} (retry {}) at {}", self.name, event, event.retries, delivery);
        if event.cmd.travels_down() {
            self.enqueue_down(event, delivery);
        } else {
            self.enqueue_up(event, delivery);
        }
    }

    /// Passes a request on to the level below under our name.
    pub(super) fn forward_down(&mut self, event: &ProtocolEvent, base: u64, ctx: &mut EngineCtx) -> u64 {
        let mut fwd = event.clone();
        fwd.src = self.name.clone();
        fwd.dst = self.destination(event.base_addr);
        fwd.in_progress = false;
        fwd.in_mshr = false;
        fwd.blocked = false;
        fwd.retries = 0;
        let delivery = self.delivery(ctx, base, Latency::Tag);
        self.enqueue_down(fwd, delivery);
        delivery
    }

    /// Non-inclusive miss: ask the level below on the requester's behalf.
    pub fn forward_request(&mut self, event: &ProtocolEvent, ctx: &mut EngineCtx) {
        self.forward_down(event, 0, ctx);
    }

    /// Passes a probe on to the level above (non-inclusive caches only have one).
    pub(super) fn forward_up(&mut self, event: &ProtocolEvent, ctx: &mut EngineCtx) {
        let mut fwd = event.clone();
        fwd.src = self.name.clone();
        fwd.dst = self.upper.first().cloned().unwrap_or_default();
        fwd.in_progress = false;
        fwd.in_mshr = false;
        let delivery = self.delivery(ctx, 0, Latency::Tag);
        self.enqueue_up(fwd, delivery);
    }

    /// Grants `granted` to the requester with the given data.
    pub(super) fn respond_up(
        &mut self,
        req: &ProtocolEvent,
        granted: LineState,
        data: &[u8],
        replay: bool,
        base: u64,
        ctx: &mut EngineCtx,
    ) -> u64 {
        let mut resp = req.make_response(ctx.ids.next(), &self.name);
        resp.payload = data.to_vec();
        resp.granted = Some(granted);
        let delivery = self.delivery(ctx, base, timing::access_or_replay(replay));
        debug!("{}: grant {} to {} for {}", self.name, granted, resp.dst, req.base_addr);
        self.enqueue_up(resp, delivery);
        delivery
    }

    pub(super) fn respond_up_from_line(
        &mut self,
        req: &ProtocolEvent,
        granted: LineState,
        line: &mut CacheLine,
        replay: bool,
        ctx: &mut EngineCtx,
    ) {
        let t = self.respond_up(req, granted, line.data(), replay, line.timestamp(), ctx);
        line.set_timestamp(t);
    }

    /// Answers a probe from below with the line's data.
    pub(super) fn respond_down(
        &mut self,
        req: &ProtocolEvent,
        line: &mut CacheLine,
        dirty: bool,
        replay: bool,
        ctx: &mut EngineCtx,
    ) {
        let mut resp = req.make_response(ctx.ids.next(), &self.name);
        resp.payload = line.data().to_vec();
        resp.dirty = dirty;
        let delivery = self.delivery(ctx, line.timestamp(), timing::access_or_replay(replay));
        line.set_timestamp(delivery);
        self.enqueue_down(resp, delivery);
    }

    /// Answers a probe from below with data taken from an upper-level message.
    pub(super) fn respond_down_from(
        &mut self,
        carrier: &ProtocolEvent,
        req: &ProtocolEvent,
        dirty: bool,
        ctx: &mut EngineCtx,
    ) {
        let mut resp = req.make_response(ctx.ids.next(), &self.name);
        resp.payload = carrier.payload.clone();
        resp.dirty = dirty;
        let delivery = self.delivery(ctx, 0, Latency::Mshr);
        self.enqueue_down(resp, delivery);
    }

    pub(super) fn send_ack_inv(&mut self, req: &ProtocolEvent, ctx: &mut EngineCtx) {
        let ack = req.make_response(ctx.ids.next(), &self.name);
        let delivery = self.delivery(ctx, 0, Latency::Tag);
        self.enqueue_down(ack, delivery);
    }

    pub(super) fn send_writeback_ack(&mut self, put: &ProtocolEvent, ctx: &mut EngineCtx) {
        let ack = put.make_response(ctx.ids.next(), &self.name);
        let delivery = self.delivery(ctx, 0, Latency::Tag);
        self.enqueue_up(ack, delivery);
    }

    pub(super) fn send_writeback(&mut self, cmd: Command, line: &mut CacheLine, dirty: bool, ctx: &mut EngineCtx) {
        let addr = line.base_addr();
        let mut wb = ProtocolEvent::new(ctx.ids.next(), cmd, addr, &self.name).with_dst(&self.destination(addr));
        if cmd == Command::PutM || self.spec.writeback_clean_data {
            wb.payload = line.data().to_vec();
        }
        wb.dirty = dirty;
        let delivery = self.delivery(ctx, line.timestamp(), Latency::Access);
        line.set_timestamp(delivery);
        debug!("{}: writeback {} {}", self.name, cmd, addr);
        self.enqueue_down(wb, delivery);
    }

    /// Writes the line back and drops it; remembers the writeback when the
    /// level below acknowledges it.
    pub(super) fn writeback_and_retire(
        &mut self,
        cmd: Command,
        line: &mut CacheLine,
        dirty: bool,
        ctx: &mut EngineCtx,
    ) {
        self.send_writeback(cmd, line, dirty, ctx);
        if self.spec.expect_writeback_ack {
            ctx.mshr.insert_writeback(line.base_addr());
        }
        line.set_state(LineState::Invalid);
    }

    fn probe_up(&mut self, cmd: Command, line: &CacheLine, dst: &str, rqstr: &str, class: Latency, ctx: &mut EngineCtx) -> u64 {
        let probe = ProtocolEvent::new(ctx.ids.next(), cmd, line.base_addr(), &self.name)
            .with_dst(dst)
            .with_rqstr(rqstr);
        let delivery = self.delivery(ctx, line.timestamp(), class);
        self.enqueue_up(probe, delivery);
        delivery
    }

    /// Invalidates every sharer, one acknowledgement expected per sharer.
    pub(super) fn invalidate_all_sharers(&mut self, line: &mut CacheLine, rqstr: &str, replay: bool, ctx: &mut EngineCtx) {
        let sharers: Vec<String> = line.sharers().map(String::from).collect();
        let mut t = line.timestamp();
        for s in sharers {
            t = self.probe_up(Command::Inv, line, &s, rqstr, timing::access_or_replay(replay), ctx);
            ctx.mshr.increment_acks_needed(line.base_addr());
        }
        line.set_timestamp(t);
    }

    /// Same as `invalidate_all_sharers` but spares `except`. Returns whether
    /// anything was sent.
    pub(super) fn invalidate_sharers_except(
        &mut self,
        line: &mut CacheLine,
        except: &str,
        rqstr: &str,
        replay: bool,
        ctx: &mut EngineCtx,
    ) -> bool {
        let others: Vec<String> = line.sharers().filter(|s| *s != except).map(String::from).collect();
        let mut t = line.timestamp();
        for s in &others {
            t = self.probe_up(Command::Inv, line, s, rqstr, timing::access_or_replay(replay), ctx);
            ctx.mshr.increment_acks_needed(line.base_addr());
        }
        line.set_timestamp(t);
        !others.is_empty()
    }

    /// FetchInv (or FetchInvX with `downgrade`) to the owner. The caller
    /// accounts for the acknowledgement.
    pub(super) fn fetch_from_owner(
        &mut self,
        line: &mut CacheLine,
        rqstr: &str,
        downgrade: bool,
        replay: bool,
        ctx: &mut EngineCtx,
    ) {
        let owner = line.owner().unwrap_or_default().to_string();
        let cmd = if downgrade { Command::FetchInvX } else { Command::FetchInv };
        let t = self.probe_up(cmd, line, &owner, rqstr, timing::tag_or_replay(replay), ctx);
        line.set_timestamp(t);
        ctx.mshr.increment_acks_needed(line.base_addr());
    }

    /// Forwards a flush below carrying the line's data when we hold it, or
    /// the flush's own payload otherwise.
    pub(super) fn forward_flush(
        &mut self,
        flush: &ProtocolEvent,
        line: Option<&mut CacheLine>,
        dirty: bool,
        ctx: &mut EngineCtx,
    ) {
        let mut fwd = flush.clone();
        fwd.src = self.name.clone();
        fwd.dst = self.destination(flush.base_addr);
        fwd.in_progress = false;
        fwd.in_mshr = false;
        fwd.retries = 0;
        fwd.dirty = dirty;
        let base = match line {
            Some(line) if line.valid() => {
                fwd.payload = line.data().to_vec();
                line.timestamp()
            }
            _ => 0,
        };
        let delivery = self.delivery(ctx, base, Latency::Tag);
        debug!("{}: flush {} down{}", self.name, flush.base_addr, if dirty { " (dirty)" } else { "" });
        self.enqueue_down(fwd, delivery);
    }

    pub(super) fn send_flush_response(&mut self, flush: &ProtocolEvent, ctx: &mut EngineCtx) {
        let resp = flush.make_response(ctx.ids.next(), &self.name);
        let delivery = self.delivery(ctx, 0, Latency::Mshr);
        self.enqueue_up(resp, delivery);
    }
}
