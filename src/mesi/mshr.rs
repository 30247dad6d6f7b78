use std::collections::{HashMap, VecDeque};

use log::trace;

use super::common::{Addr, EventId};
use super::event::ProtocolEvent;

#[derive(Clone, Debug)]
pub enum MshrEntry {
    Parked(ProtocolEvent),
    /// replay this other address once the owning row drains
    Pointer(Addr),
    /// a writeback for the row's own address still waits for its AckPut
    WritebackMarker,
}

impl MshrEntry {
    pub fn event(&self) -> Option<&ProtocolEvent> {
        match self {
            MshrEntry::Parked(ev) => Some(ev),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct MshrRow {
    queue: VecDeque<MshrEntry>,
    acks_needed: u32,
    temp_data: Option<Vec<u8>>,
}

impl MshrRow {
    fn idle(&self) -> bool {
        self.queue.is_empty() && self.acks_needed == 0 && self.temp_data.is_none()
    }
}

/// Miss status holding registers: per-address queues of parked work.
///
/// Only parked events count against the capacity; pointers and writeback
/// markers are free.
#[derive(Debug)]
pub struct Mshr {
    owner: String,
    rows: HashMap<Addr, MshrRow>,
    size: usize,
    max_size: usize,
}

impl Mshr {
    pub fn new(owner: &str, max_size: usize) -> Self {
        Mshr { owner: owner.to_string(), rows: HashMap::new(), size: 0, max_size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.size >= self.max_size
    }
    /// One slot is kept free for events arriving from below.
    pub fn is_almost_full(&self) -> bool {
        self.size + 1 >= self.max_size
    }

    /// Parks `event` at the back of the row for `addr`. A full MSHR hands the
    /// event back so the caller can NACK it.
    pub fn insert(&mut self, addr: Addr, mut event: ProtocolEvent) -> Result<(), ProtocolEvent> {
        if self.is_full() {
            return Err(event);
        }
        event.in_mshr = true;
        trace!("{}: MSHR park {} at {}", self.owner, event.cmd, addr);
        self.rows.entry(addr).or_default().queue.push_back(MshrEntry::Parked(event));
        self.size += 1;
        Ok(())
    }

    /// Probes from below jump the queue: they go first, or right behind a
    /// front event that is already being serviced.
    pub fn insert_inv(&mut self, addr: Addr, mut event: ProtocolEvent, in_progress: bool) -> Result<(), ProtocolEvent> {
        if self.is_full() {
            return Err(event);
        }
        event.in_mshr = true;
        let row = self.rows.entry(addr).or_default();
        let pos = if in_progress && !row.queue.is_empty() { 1 } else { 0 };
        trace!("{}: MSHR park probe {} at {} slot {}", self.owner, event.cmd, addr, pos);
        row.queue.insert(pos, MshrEntry::Parked(event));
        self.size += 1;
        Ok(())
    }

    pub fn insert_pointer(&mut self, key: Addr, pointer: Addr) {
        if key == pointer {
            panic!("{}: MSHR pointer from {} to itself", self.owner, key);
        }
        self.rows.entry(key).or_default().queue.push_back(MshrEntry::Pointer(pointer));
    }

    pub fn insert_writeback(&mut self, addr: Addr) {
        self.rows.entry(addr).or_default().queue.push_front(MshrEntry::WritebackMarker);
    }

    /// Re-appends what was left of a replay.
    pub fn insert_all(&mut self, addr: Addr, entries: VecDeque<MshrEntry>) {
        if entries.is_empty() {
            return;
        }
        let parked = entries.iter().filter(|e| e.event().is_some()).count();
        let row = self.rows.entry(addr).or_default();
        for mut entry in entries {
            if let MshrEntry::Parked(ev) = &mut entry {
                ev.in_mshr = true;
            }
            row.queue.push_back(entry);
        }
        self.size += parked;
    }

    /// Takes every entry of the row. The row itself survives while acks or
    /// temporary data are still outstanding.
    pub fn remove_all(&mut self, addr: Addr) -> VecDeque<MshrEntry> {
        let Some(row) = self.rows.get_mut(&addr) else {
            return VecDeque::new();
        };
        let mut entries = std::mem::take(&mut row.queue);
        let idle = row.idle();
        if idle {
            self.rows.remove(&addr);
        }
        self.size -= entries.iter().filter(|e| e.event().is_some()).count();
        for entry in entries.iter_mut() {
            if let MshrEntry::Parked(ev) = entry {
                ev.in_mshr = false;
            }
        }
        entries
    }

    /// Removes the event at the front of the row. Anything else at the front
    /// is a bookkeeping error.
    pub fn remove_front(&mut self, addr: Addr) -> ProtocolEvent {
        let front = self.rows.get_mut(&addr).and_then(|row| row.queue.pop_front());
        let mut event = match front {
            Some(MshrEntry::Parked(ev)) => ev,
            other => panic!("{}: MSHR front of {} is not an event: {:?}", self.owner, addr, other),
        };
        self.size -= 1;
        event.in_mshr = false;
        self.retire_if_idle(addr);
        event
    }

    pub fn remove_element(&mut self, addr: Addr, id: EventId) -> Option<ProtocolEvent> {
        let row = self.rows.get_mut(&addr)?;
        let pos = row.queue.iter().position(|e| e.event().map_or(false, |ev| ev.id == id))?;
        let mut event = match row.queue.remove(pos) {
            Some(MshrEntry::Parked(ev)) => ev,
            _ => return None,
        };
        self.size -= 1;
        event.in_mshr = false;
        self.retire_if_idle(addr);
        Some(event)
    }

    pub fn remove_writeback(&mut self, addr: Addr) {
        let Some(row) = self.rows.get_mut(&addr) else {
            return;
        };
        if let Some(pos) = row.queue.iter().position(|e| matches!(e, MshrEntry::WritebackMarker)) {
            row.queue.remove(pos);
        }
        self.retire_if_idle(addr);
    }

    fn retire_if_idle(&mut self, addr: Addr) {
        if self.rows.get(&addr).map_or(false, |row| row.idle()) {
            self.rows.remove(&addr);
        }
    }

    pub fn is_hit(&self, addr: Addr) -> bool {
        self.rows.get(&addr).map_or(false, |row| !row.queue.is_empty())
    }
    /// the front entry is a parked event
    pub fn exists(&self, addr: Addr) -> bool {
        self.lookup_front(addr).is_some()
    }
    pub fn lookup_front(&self, addr: Addr) -> Option<&ProtocolEvent> {
        self.rows.get(&addr)?.queue.front()?.event()
    }
    pub fn pending_writeback(&self, addr: Addr) -> bool {
        self.rows
            .get(&addr)
            .map_or(false, |row| row.queue.iter().any(|e| matches!(e, MshrEntry::WritebackMarker)))
    }
    pub fn entries(&self, addr: Addr) -> impl Iterator<Item = &MshrEntry> {
        self.rows.get(&addr).into_iter().flat_map(|row| row.queue.iter())
    }

    pub fn acks_needed(&self, addr: Addr) -> u32 {
        self.rows.get(&addr).map_or(0, |row| row.acks_needed)
    }
    pub fn set_acks_needed(&mut self, addr: Addr, acks: u32) {
        self.rows.entry(addr).or_default().acks_needed = acks;
        self.retire_if_idle(addr);
    }
    pub fn increment_acks_needed(&mut self, addr: Addr) {
        self.rows.entry(addr).or_default().acks_needed += 1;
    }
    pub fn decrement_acks_needed(&mut self, addr: Addr) {
        let acks = self.acks_needed(addr);
        if acks == 0 {
            panic!("{}: acknowledgement count for {} would drop below zero", self.owner, addr);
        }
        if let Some(row) = self.rows.get_mut(&addr) {
            row.acks_needed = acks - 1;
        }
        self.retire_if_idle(addr);
    }

    pub fn set_temp_data(&mut self, addr: Addr, data: Vec<u8>) {
        self.rows.entry(addr).or_default().temp_data = Some(data);
    }
    pub fn temp_data(&self, addr: Addr) -> Option<&[u8]> {
        self.rows.get(&addr)?.temp_data.as_deref()
    }
    pub fn clear_temp_data(&mut self, addr: Addr) {
        if let Some(row) = self.rows.get_mut(&addr) {
            row.temp_data = None;
        }
        self.retire_if_idle(addr);
    }
}
