// outgoing message queues with per-message delivery times

use std::collections::VecDeque;

use super::event::ProtocolEvent;

#[derive(Clone, Debug)]
pub struct Response {
    pub event: ProtocolEvent,
    pub delivery_time: u64,
}

/*
    messages are kept sorted by delivery time, except that a message never
    overtakes an earlier message for the same line: insertion walks back from
    the tail and stops at the first entry that is not later than the new one or
    that targets the same address.
 */

#[derive(Debug, Default)]
pub struct OutgoingQueue {
    q: VecDeque<Response>,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        OutgoingQueue { q: VecDeque::new() }
    }

    pub fn push(&mut self, event: ProtocolEvent, delivery_time: u64) {
        let mut pos = self.q.len();
        while pos > 0 {
            let prev = &self.q[pos - 1];
            if delivery_time >= prev.delivery_time || prev.event.base_addr == event.base_addr {
                break;
            }
            pos -= 1;
        }
        self.q.insert(pos, Response { event, delivery_time });
    }

    /// Pops the head if its delivery time has come.
    pub fn pop_ready(&mut self, now: u64) -> Option<ProtocolEvent> {
        if self.q.front()?.delivery_time <= now {
            self.q.pop_front().map(|r| r.event)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Response> {
        self.q.iter()
    }
    pub fn len(&self) -> usize {
        self.q.len()
    }
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }
}
