use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::stats::PipelineStats;

/// One group of consecutive projections, ready for preprocessing.
/// `data` is `group_size * rows * cols` floats, projection-major.
pub struct CompletedGroup {
    pub generation: u64,
    pub data: Vec<f32>,
}

struct Slot {
    /// Generation stamped at allocation; lets a writer detect that its
    /// slot was evicted while it held only the slot lock.
    generation: u64,
    filled: u64,
    count: u32,
    data: Vec<f32>,
}

struct Window {
    /// generation -> slot index
    live: BTreeMap<u64, usize>,
    free: Vec<usize>,
    /// Completed but not yet published (held for in-order delivery).
    completed: Vec<u64>,
    /// Next generation to hand to the preprocessor. Anything below is
    /// published or evicted and will not be accepted again.
    next_publish: u64,
    /// Generations marked published (slot may still be live).
    published: BTreeMap<u64, ()>,
}

/// Bounded, group-aligned staging area for projection frames.
///
/// Invariants:
/// - a slot is complete exactly when all `group_size` bits are set;
/// - at most `capacity` generations are live at once;
/// - frames older than the publish floor are dropped;
/// - allocating beyond the window evicts the oldest live generation,
///   complete or not;
/// - generations reach the preprocessor queue in strictly increasing
///   order, holes unblocked only by eviction.
///
/// The live window is guarded by one short lock; each slot carries its
/// own lock so the u16 -> f32 payload copy runs outside the window
/// lock.
pub struct GroupRing {
    group_size: u32,
    pixels: usize,
    window: Mutex<Window>,
    slots: Vec<Mutex<Slot>>,
    ready_tx: Sender<CompletedGroup>,
    stats: Arc<PipelineStats>,
}

impl GroupRing {
    /// Create a ring of `capacity` live generations and the receiving
    /// half of its completed-group queue.
    pub fn new(
        rows: u32,
        cols: u32,
        group_size: u32,
        capacity: usize,
        stats: Arc<PipelineStats>,
    ) -> (Arc<Self>, Receiver<CompletedGroup>) {
        assert!(
            (1..=64).contains(&group_size),
            "group bitmap holds at most 64 projections"
        );
        let pixels = rows as usize * cols as usize;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(2 * capacity.max(1));
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    generation: u64::MAX,
                    filled: 0,
                    count: 0,
                    data: vec![0.0; group_size as usize * pixels],
                })
            })
            .collect();
        let ring = Arc::new(Self {
            group_size,
            pixels,
            window: Mutex::new(Window {
                live: BTreeMap::new(),
                free: (0..capacity).collect(),
                completed: Vec::new(),
                next_publish: 0,
                published: BTreeMap::new(),
            }),
            slots,
            ready_tx,
            stats,
        });
        (ring, ready_rx)
    }

    /// Stage one projection. `index` is the global projection index;
    /// the generation is `index / group_size`.
    pub fn push(&self, index: u32, payload: &[u16]) {
        debug_assert_eq!(payload.len(), self.pixels);
        let generation = index as u64 / self.group_size as u64;
        let offset = (index % self.group_size) as usize;

        let slot_index = {
            let mut window = self.window.lock().unwrap();
            if let Some(&slot) = window.live.get(&generation) {
                Some(slot)
            } else if generation < window.next_publish {
                debug!(index, generation, "frame below publish floor, dropped");
                self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.allocate(&mut window, generation)
            }
        };
        let Some(slot_index) = slot_index else {
            return;
        };

        // Payload conversion happens outside the window lock.
        let completed = {
            let mut slot = self.slots[slot_index].lock().unwrap();
            if slot.generation != generation {
                // Evicted between window release and slot acquire.
                self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let bit = 1u64 << offset;
            let newly_filled = slot.filled & bit == 0;
            if newly_filled {
                slot.filled |= bit;
                slot.count += 1;
            } else {
                debug!(index, generation, "late duplicate, overwriting");
                self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
            }
            let base = offset * self.pixels;
            for (dst, &src) in slot.data[base..base + self.pixels].iter_mut().zip(payload) {
                *dst = f32::from(src);
            }
            newly_filled && slot.count == self.group_size
        };

        if completed {
            let mut window = self.window.lock().unwrap();
            // Only publish if the generation is still live in this slot.
            if window.live.get(&generation) == Some(&slot_index) {
                window.completed.push(generation);
                self.drain_publishable(&mut window);
            }
        }
    }

    /// Clear all staged projections. Called when a new dark/flat burst
    /// restarts the acquisition window.
    pub fn reset(&self) {
        let mut window = self.window.lock().unwrap();
        let live: Vec<(u64, usize)> = window.live.iter().map(|(&g, &s)| (g, s)).collect();
        for (generation, slot_index) in live {
            let mut slot = self.slots[slot_index].lock().unwrap();
            if !window.published.contains_key(&generation) {
                self.stats
                    .dropped_evicted
                    .fetch_add(u64::from(slot.count), Ordering::Relaxed);
            }
            slot.generation = u64::MAX;
            slot.filled = 0;
            slot.count = 0;
            window.free.push(slot_index);
        }
        window.live.clear();
        window.completed.clear();
        window.published.clear();
        window.next_publish = 0;
        info!("projection ring reset");
    }

    /// Live generations, oldest first. Exposed for tests and status
    /// reporting.
    pub fn live_generations(&self) -> Vec<u64> {
        self.window.lock().unwrap().live.keys().copied().collect()
    }

    fn allocate(&self, window: &mut Window, generation: u64) -> Option<usize> {
        let slot_index = match window.free.pop() {
            Some(slot) => slot,
            None => {
                // A full ring never evicts a newer generation to host
                // an older straggler.
                if window
                    .live
                    .first_key_value()
                    .is_some_and(|(&oldest, _)| generation < oldest)
                {
                    warn!(generation, "ring full, frame older than live window dropped");
                    self.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                self.evict_oldest(window)?
            }
        };
        {
            let mut slot = self.slots[slot_index].lock().unwrap();
            slot.generation = generation;
            slot.filled = 0;
            slot.count = 0;
        }
        window.live.insert(generation, slot_index);
        Some(slot_index)
    }

    fn evict_oldest(&self, window: &mut Window) -> Option<usize> {
        let (&oldest, &slot_index) = window.live.iter().next()?;
        window.live.remove(&oldest);
        let was_published = window.published.remove(&oldest).is_some();
        {
            let mut slot = self.slots[slot_index].lock().unwrap();
            if !was_published {
                warn!(
                    generation = oldest,
                    staged = slot.count,
                    "ring full, evicting incomplete generation"
                );
                self.stats
                    .dropped_evicted
                    .fetch_add(u64::from(slot.count), Ordering::Relaxed);
                self.stats
                    .generations_evicted
                    .fetch_add(1, Ordering::Relaxed);
            }
            slot.generation = u64::MAX;
            slot.filled = 0;
            slot.count = 0;
        }
        window.completed.retain(|&g| g != oldest);
        // Nothing below the evicted generation can be published now.
        if window.next_publish <= oldest {
            window.next_publish = oldest + 1;
            self.drain_publishable(window);
        }
        Some(slot_index)
    }

    fn drain_publishable(&self, window: &mut Window) {
        while let Some(pos) = window
            .completed
            .iter()
            .position(|&g| g == window.next_publish)
        {
            let generation = window.completed.swap_remove(pos);
            let slot_index = window.live[&generation];
            let data = self.slots[slot_index].lock().unwrap().data.clone();
            match self.ready_tx.try_send(CompletedGroup { generation, data }) {
                Ok(()) => {
                    self.stats
                        .preprocessed
                        .fetch_add(u64::from(self.group_size), Ordering::Relaxed);
                    window.published.insert(generation, ());
                }
                Err(_) => {
                    warn!(generation, "preprocessor queue full, group dropped");
                    self.stats
                        .dropped_evicted
                        .fetch_add(u64::from(self.group_size), Ordering::Relaxed);
                    window.published.insert(generation, ());
                }
            }
            window.next_publish = generation + 1;
        }
    }
}
