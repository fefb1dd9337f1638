//! Statistics Managers (C12): periodic polling of switch counters, diffed
//! against the last sample and published to the MODB under rolling
//! generation IDs (spec.md section 4.12).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ofswitch::{Cookie, Match};

/// Identifies one counted flow: (cookie, priority, match). Distinct from
/// `FlowEntry`'s identity key (table+priority+match) because stats
/// reconciliation must not conflate two different cookies sharing a
/// (priority, match) across tables during a transient MOD.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub cookie: Cookie,
    pub priority: u16,
    pub match_: Match,
}

const RING_BUFFER_SIZE: usize = 5;

#[derive(Debug, Clone, Default)]
struct CounterEntry {
    last_packets: u64,
    last_bytes: u64,
    diff_packets: u64,
    diff_bytes: u64,
    visited: bool,
    age: u32,
    generations: VecDeque<u64>,
}

/// Poller variant, purely descriptive for logging/interval selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Interface,
    ContractDrop,
    SecurityGroup,
}

impl StatsKind {
    pub fn default_interval(&self) -> Duration {
        match self {
            StatsKind::Interface => Duration::from_secs(30),
            StatsKind::ContractDrop | StatsKind::SecurityGroup => Duration::from_secs(10),
        }
    }
}

/// A published counter sample, ready for MODB insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCounter {
    pub generation_id: u64,
    pub key: CounterKey,
    pub diff_packets: u64,
    pub diff_bytes: u64,
}

/// Age threshold (poll cycles) after which an unvisited counter entry is
/// dropped from tracking.
pub const MAX_UNVISITED_AGE: u32 = 3;

/// Tracks one poller's counter state across poll cycles.
pub struct CounterState {
    kind: StatsKind,
    entries: HashMap<CounterKey, CounterEntry>,
    next_generation: u64,
}

impl CounterState {
    pub fn new(kind: StatsKind) -> Self {
        Self { kind, entries: HashMap::new(), next_generation: 1 }
    }

    pub fn kind(&self) -> StatsKind {
        self.kind
    }

    /// Marks the start of a poll cycle: clears the visited bit on every
    /// tracked entry.
    pub fn begin_cycle(&mut self) {
        for entry in self.entries.values_mut() {
            entry.visited = false;
        }
    }

    /// Records one counter reading from the poll reply. OVS reports
    /// `u64::MAX` for a counter it doesn't support on this port/flow; treat
    /// that sentinel as 0 rather than a genuine multi-exabyte count.
    pub fn observe(&mut self, key: CounterKey, packets: u64, bytes: u64) {
        let packets = if packets == u64::MAX { 0 } else { packets };
        let bytes = if bytes == u64::MAX { 0 } else { bytes };
        let entry = self.entries.entry(key).or_insert_with(|| CounterEntry {
            last_packets: packets,
            last_bytes: bytes,
            ..Default::default()
        });
        entry.diff_packets = packets.saturating_sub(entry.last_packets);
        entry.diff_bytes = bytes.saturating_sub(entry.last_bytes);
        entry.last_packets = packets;
        entry.last_bytes = bytes;
        entry.visited = true;
        entry.age = 0;
    }

    /// Ends a poll cycle: publishes non-zero diffs under fresh generation
    /// ids, ages out unvisited entries, and returns what was published
    /// plus the removed (garbage-collected) keys.
    pub fn end_cycle(&mut self) -> (Vec<PublishedCounter>, Vec<CounterKey>) {
        let mut published = Vec::new();
        let mut removed = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            if entry.visited {
                if entry.diff_packets > 0 || entry.diff_bytes > 0 {
                    let gen_id = self.next_generation;
                    self.next_generation += 1;
                    entry.generations.push_back(gen_id);
                    if entry.generations.len() > RING_BUFFER_SIZE {
                        entry.generations.pop_front();
                    }
                    published.push(PublishedCounter {
                        generation_id: gen_id,
                        key: key.clone(),
                        diff_packets: entry.diff_packets,
                        diff_bytes: entry.diff_bytes,
                    });
                }
            } else {
                entry.age += 1;
                if entry.age > MAX_UNVISITED_AGE {
                    removed.push(key.clone());
                }
            }
        }

        for key in &removed {
            self.entries.remove(key);
        }

        (published, removed)
    }

    /// A flow-removed event: publish its final counters immediately, then
    /// drop it from tracking (spec.md section 4.12: "their final counters
    /// are published before removal").
    pub fn flow_removed(&mut self, key: &CounterKey) -> Option<PublishedCounter> {
        let entry = self.entries.remove(key)?;
        if entry.diff_packets == 0 && entry.diff_bytes == 0 {
            return None;
        }
        let gen_id = self.next_generation;
        self.next_generation += 1;
        Some(PublishedCounter {
            generation_id: gen_id,
            key: key.clone(),
            diff_packets: entry.diff_packets,
            diff_bytes: entry.diff_bytes,
        })
    }

    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }
}
