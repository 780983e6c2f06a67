use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use atomic_float::AtomicF32;

/// Counters shared between pipeline stages (writers) and the server /
/// tests (readers). All fields use relaxed atomics; individual reads
/// may be slightly stale but totals are exact once the stream quiesces.
///
/// The accounting invariant these support: projections accepted equals
/// projections preprocessed plus projections explicitly dropped
/// (pre-calibration or by ring eviction / staleness).
pub struct PipelineStats {
    /// Projection frames accepted by the classifier.
    pub projections_accepted: AtomicU64,
    /// Projections dropped because no calibration was ready.
    pub dropped_uncalibrated: AtomicU64,
    /// Projections dropped as older than the live ring window.
    pub dropped_stale: AtomicU64,
    /// Projections lost to whole-generation evictions.
    pub dropped_evicted: AtomicU64,
    /// Frames dropped for shape or protocol problems.
    pub dropped_malformed: AtomicU64,
    /// Projections that reached the transposer.
    pub preprocessed: AtomicU64,
    /// Completed generations evicted before completion.
    pub generations_evicted: AtomicU64,
    /// Preview volumes emitted.
    pub previews_emitted: AtomicU64,
    /// Ingest throughput in frames per second (updated ~once a second).
    pub ingest_rate: AtomicF32,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            projections_accepted: AtomicU64::new(0),
            dropped_uncalibrated: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
            dropped_evicted: AtomicU64::new(0),
            dropped_malformed: AtomicU64::new(0),
            preprocessed: AtomicU64::new(0),
            generations_evicted: AtomicU64::new(0),
            previews_emitted: AtomicU64::new(0),
            ingest_rate: AtomicF32::new(0.0),
        })
    }

    /// Total projections explicitly dropped after acceptance.
    pub fn dropped(&self) -> u64 {
        self.dropped_stale.load(Ordering::Relaxed) + self.dropped_evicted.load(Ordering::Relaxed)
    }
}
