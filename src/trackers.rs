//! Stable flow identifiers and burst detection for the sample pipeline.
//!
//! Both trackers bound their state with a min-heap keyed by last-seen time.
//! Heap entries go stale whenever a state is touched; a revision counter on
//! each state lets eviction skip them lazily instead of rebuilding the heap.

use crate::buffer::FlowKey;
use crate::sample::BurstSummary;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_BURST_GAP: Duration = Duration::from_millis(350);
pub const DEFAULT_MAX_TRACKED_FLOWS: usize = 4096;
pub const DEFAULT_MAX_TRACKED_BURSTS: usize = 4096;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct HeapSlot<K: Copy + Eq> {
    last_seen: Instant,
    revision: u64,
    key: K,
}

impl<K: Copy + Eq> PartialOrd for HeapSlot<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Copy + Eq> Ord for HeapSlot<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.last_seen, self.revision).cmp(&(other.last_seen, other.revision))
    }
}

struct FlowState {
    generation: u32,
    last_seen: Instant,
    revision: u64,
}

/// Assigns a stable 64-bit id per flow key: the FNV-1a hash of the key XORed
/// with a 32-bit generation counter. A key reappearing after `flow_ttl` (or
/// after eviction) receives a fresh generation so old samples never collide
/// with new ones.
pub struct FlowTracker {
    entries: FxHashMap<FlowKey, FlowState>,
    heap: BinaryHeap<Reverse<HeapSlot<FlowKey>>>,
    next_generation: u32,
    next_revision: u64,
    flow_ttl: Duration,
    max_entries: usize,
}

impl FlowTracker {
    pub fn new(flow_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            heap: BinaryHeap::new(),
            next_generation: 1,
            next_revision: 1,
            flow_ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn flow_id(&mut self, key: &FlowKey, now: Instant) -> u64 {
        let revision = self.next_revision;
        self.next_revision += 1;

        let generation = if let Some(state) = self.entries.get_mut(key) {
            if now.saturating_duration_since(state.last_seen) >= self.flow_ttl {
                state.generation = self.next_generation;
                self.next_generation = self.next_generation.wrapping_add(1);
            }
            state.last_seen = now;
            state.revision = revision;
            state.generation
        } else {
            self.evict_to_capacity();
            let generation = self.next_generation;
            self.next_generation = self.next_generation.wrapping_add(1);
            self.entries.insert(
                *key,
                FlowState {
                    generation,
                    last_seen: now,
                    revision,
                },
            );
            generation
        };
        self.heap.push(Reverse(HeapSlot {
            last_seen: now,
            revision,
            key: *key,
        }));
        fnv1a(&key.hash_bytes()) ^ u64::from(generation)
    }

    fn evict_to_capacity(&mut self) {
        while self.entries.len() >= self.max_entries {
            let Some(Reverse(slot)) = self.heap.pop() else {
                break;
            };
            match self.entries.get(&slot.key) {
                // Stale heap slot: the state has been touched since.
                Some(state) if state.revision != slot.revision => continue,
                Some(_) => {
                    self.entries.remove(&slot.key);
                }
                None => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct BurstState {
    burst_index: u64,
    last_seen: Duration,
    packet_count: u64,
    byte_count: u64,
    revision: u64,
}

/// Groups packets on a flow into bursts separated by an inter-arrival gap.
/// Timestamps are monotonic offsets supplied by the caller so tests can
/// drive the clock explicitly.
pub struct BurstTracker {
    states: FxHashMap<u64, BurstState>,
    heap: BinaryHeap<Reverse<BurstSlot>>,
    gap: Duration,
    max_entries: usize,
    next_revision: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct BurstSlot {
    last_seen: Duration,
    revision: u64,
    flow_id: u64,
}

impl PartialOrd for BurstSlot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BurstSlot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.last_seen, self.revision).cmp(&(other.last_seen, other.revision))
    }
}

impl BurstTracker {
    pub fn new(gap: Duration, max_entries: usize) -> Self {
        Self {
            states: FxHashMap::default(),
            heap: BinaryHeap::new(),
            gap,
            max_entries: max_entries.max(1),
            next_revision: 1,
        }
    }

    /// Records a packet and returns the burst it belongs to, including the
    /// accumulated packet and byte counts for that burst.
    pub fn record(&mut self, flow_id: u64, timestamp: Duration, byte_count: u64) -> BurstSummary {
        let revision = self.next_revision;
        self.next_revision += 1;

        let summary = if let Some(state) = self.states.get_mut(&flow_id) {
            let elapsed = timestamp.saturating_sub(state.last_seen);
            if elapsed > self.gap {
                state.burst_index += 1;
                state.packet_count = 1;
                state.byte_count = byte_count;
            } else {
                state.packet_count += 1;
                state.byte_count += byte_count;
            }
            state.last_seen = timestamp;
            state.revision = revision;
            BurstSummary {
                burst_id: state.burst_index,
                packet_count: state.packet_count,
                byte_count: state.byte_count,
            }
        } else {
            self.evict_to_capacity();
            self.states.insert(
                flow_id,
                BurstState {
                    burst_index: 1,
                    last_seen: timestamp,
                    packet_count: 1,
                    byte_count,
                    revision,
                },
            );
            BurstSummary {
                burst_id: 1,
                packet_count: 1,
                byte_count,
            }
        };
        self.heap.push(Reverse(BurstSlot {
            last_seen: timestamp,
            revision,
            flow_id,
        }));
        summary
    }

    fn evict_to_capacity(&mut self) {
        while self.states.len() >= self.max_entries {
            let Some(Reverse(slot)) = self.heap.pop() else {
                break;
            };
            match self.states.get(&slot.flow_id) {
                Some(state) if state.revision != slot.revision => continue,
                Some(_) => {
                    self.states.remove(&slot.flow_id);
                }
                None => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}
