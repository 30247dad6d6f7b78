use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    Mesi,
    Msi,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Inclusion {
    Inclusive,
    NonInclusive,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheSpec {              // unit         reasonable defaults
    pub protocol: Protocol,         // -            Mesi
    pub inclusion: Inclusion,       // -            Inclusive
    pub expect_writeback_ack: bool, // -            true
    pub silent_evict_clean: bool,   // -            false
    pub writeback_clean_data: bool, // -            false
    pub line_size: u64,             // bytes        64
    pub num_lines: usize,           // lines        256
    pub assoc: usize,               // lines        4
    pub mshr_entries: usize,        // events       16
    pub tag_latency: u64,           // cycles       1
    pub access_latency: u64,        // cycles       4
    pub mshr_latency: u64,          // cycles       1
}

impl Default for CacheSpec {
    fn default() -> Self {
        CacheSpec {
            protocol: Protocol::Mesi,
            inclusion: Inclusion::Inclusive,
            expect_writeback_ack: true,
            silent_evict_clean: false,
            writeback_clean_data: false,
            line_size: 64,
            num_lines: 256,
            assoc: 4,
            mshr_entries: 16,
            tag_latency: 1,
            access_latency: 4,
            mshr_latency: 1,
        }
    }
}

impl CacheSpec {
    pub fn inclusive(&self) -> bool {
        self.inclusion == Inclusion::Inclusive
    }
    pub fn mesi(&self) -> bool {
        self.protocol == Protocol::Mesi
    }
    pub fn num_sets(&self) -> usize {
        self.num_lines / self.assoc
    }
    /// Rejects configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // one slot stays reserved for events from below
        if self.mshr_entries < 2 {
            return Err(ConfigError::MshrTooSmall(self.mshr_entries));
        }
        if self.num_lines == 0 {
            return Err(ConfigError::NoLines);
        }
        if !self.line_size.is_power_of_two() {
            return Err(ConfigError::LineSizeNotPowerOfTwo(self.line_size));
        }
        if self.assoc == 0 || self.num_lines % self.assoc != 0 {
            return Err(ConfigError::BadAssociativity { lines: self.num_lines, assoc: self.assoc });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    MshrTooSmall(usize),
    NoLines,
    LineSizeNotPowerOfTwo(u64),
    BadAssociativity { lines: usize, assoc: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MshrTooSmall(n) => write!(f, "MSHR needs at least 2 entries, got {}", n),
            ConfigError::NoLines => write!(f, "number of lines must be positive"),
            ConfigError::LineSizeNotPowerOfTwo(s) => write!(f, "line size {} is not a power of two", s),
            ConfigError::BadAssociativity { lines, assoc } => {
                write!(f, "associativity {} does not divide {} lines", assoc, lines)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub mod timing {
    use super::CacheSpec;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub enum Latency {
        Tag,
        Access,
        Mshr,
    }

    pub fn of(spec: &CacheSpec, class: Latency) -> u64 {
        match class {
            Latency::Tag => spec.tag_latency,
            Latency::Access => spec.access_latency,
            Latency::Mshr => spec.mshr_latency,
        }
    }
    /// replays read out of the MSHR, fresh arrivals pay for the array access
    pub fn access_or_replay(replay: bool) -> Latency {
        if replay { Latency::Mshr } else { Latency::Access }
    }
    pub fn tag_or_replay(replay: bool) -> Latency {
        if replay { Latency::Mshr } else { Latency::Tag }
    }
    pub fn delivery(spec: &CacheSpec, now: u64, base: u64, class: Latency) -> u64 {
        now.max(base) + of(spec, class)
    }
    pub fn backoff(spec: &CacheSpec, retries: u32) -> u64 {
        spec.mshr_latency + (1u64 << retries.min(10))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct Addr(pub u64);

impl Addr {
    /// line-aligned address under the given line size
    pub fn base(&self, line_size: u64) -> Addr {
        Addr(self.0 & !(line_size - 1))
    }
    pub fn line_number(&self, line_size: u64) -> u64 {
        self.0 / line_size
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventId {
    pub origin: u32,
    pub seq: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.origin, self.seq)
    }
}

/// Monotonic event id source, one per component.
#[derive(Debug)]
pub struct EventIds {
    origin: u32,
    next: u64,
}

impl EventIds {
    pub fn new(origin: u32) -> Self {
        EventIds { origin, next: 0 }
    }
    pub fn next(&mut self) -> EventId {
        let id = EventId { origin: self.origin, seq: self.next };
        self.next += 1;
        id
    }
}
