//! End-to-end runs of the CPU pipeline: calibration, out-of-order
//! staging, preprocessing, and sinogram assembly, checked against
//! fixed reference values.

use std::sync::atomic::Ordering;
use std::time::Duration;

use proptest::prelude::*;

use slicecast::config::{Config, FilterKind, PipelineSettings, ScanMode};
use slicecast::frame::{Frame, FrameKind};
use slicecast::pipeline::Pipeline;

const BASE_PATTERN: [u16; 20] = [
    2, 5, 3, 7, 1, 4, 6, 2, 9, 5, 1, 3, 7, 5, 8, 6, 8, 8, 7, 3,
];

const SINO_HEAD: [f32; 10] = [
    0.110098, -0.272487, 0.133713, -0.491590, 0.520265, 0.101732, -0.201946, 0.119072, -0.369920,
    0.351062,
];

const SINO_TAIL: [f32; 10] = [
    -0.040253, -0.094602, -0.078659, -0.107789, 0.321304, -0.028346, -0.080572, -0.066762,
    -0.086848, 0.262528,
];

fn scan_config(group_size: u32, ring_capacity: usize) -> Config {
    let mut config = Config::default();
    config.geometry.rows = 4;
    config.geometry.cols = 5;
    config.geometry.angle_count = 16;
    config.pipeline = PipelineSettings {
        group_size,
        ring_capacity,
        num_darks: 1,
        num_flats: 1,
        threads: 4,
        filter: FilterKind::Shepp,
        gaussian_lowpass: false,
        paganin: None,
        scan_mode: ScanMode::Dynamic,
        update_interval: 100,
    };
    config
}

fn frame(kind: FrameKind, index: u32, payload: Vec<u16>) -> Frame {
    Frame {
        kind,
        index,
        rows: 4,
        cols: 5,
        payload,
    }
}

fn projection(index: u32) -> Frame {
    let bump = u16::from(index % 2 == 1);
    frame(
        FrameKind::Projection,
        index,
        BASE_PATTERN.iter().map(|&v| v + bump).collect(),
    )
}

fn calibrate(pipeline: &Pipeline) {
    pipeline
        .accept(frame(FrameKind::Dark, 0, vec![0; 20]))
        .unwrap();
    pipeline
        .accept(frame(FrameKind::Flat, 0, vec![1; 20]))
        .unwrap();
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-6, "index {i}: actual {a}, expected {e}");
    }
}

#[test]
fn full_scan_produces_reference_sinogram() {
    let pipeline = Pipeline::new(scan_config(16, 2)).unwrap();
    calibrate(&pipeline);
    for i in 0..16 {
        pipeline.accept(projection(i)).unwrap();
    }

    let updates = pipeline.pump_all();
    assert_eq!(updates.len(), 1);
    let sino = &updates[0].data;
    assert_close(&sino[..10], &SINO_HEAD);
    assert_close(&sino[sino.len() - 10..], &SINO_TAIL);
}

#[test]
fn out_of_order_arrival_matches_in_order_sinogram() {
    let pipeline = Pipeline::new(scan_config(16, 2)).unwrap();
    calibrate(&pipeline);

    // 0..=12 in order, a burst from the next revolution, then the
    // stragglers 13 and 14
    for i in 0..13 {
        pipeline.accept(projection(i)).unwrap();
    }
    for i in [15, 16, 17, 18] {
        pipeline.accept(projection(i)).unwrap();
    }
    for i in [13, 14] {
        pipeline.accept(projection(i)).unwrap();
    }

    let updates = pipeline.pump_all();
    assert_eq!(updates.len(), 1, "only the completed revolution emits");
    let sino = &updates[0].data;
    assert_close(&sino[..10], &SINO_HEAD);
    assert_close(&sino[sino.len() - 10..], &SINO_TAIL);
}

#[test]
fn bounded_ring_evicts_oldest_generation() {
    // capacity 2 generations of 4 projections each
    let pipeline = Pipeline::new(scan_config(4, 2)).unwrap();
    calibrate(&pipeline);

    for i in 0..4 {
        pipeline.accept(projection(i)).unwrap(); // group 0, complete
    }
    for i in 4..8 {
        pipeline.accept(projection(i)).unwrap(); // group 1, complete
    }
    pipeline.accept(projection(8)).unwrap(); // group 2 evicts group 0

    assert_eq!(pipeline.ring.live_generations(), vec![1, 2]);

    // a stray frame for the evicted generation is silently dropped
    let stale_before = pipeline.stats.dropped_stale.load(Ordering::Relaxed);
    pipeline.accept(projection(0)).unwrap();
    assert_eq!(pipeline.ring.live_generations(), vec![1, 2]);
    assert_eq!(
        pipeline.stats.dropped_stale.load(Ordering::Relaxed),
        stale_before + 1
    );
}

#[test]
fn recalibration_mid_revolution_restarts_assembly() {
    // 4 groups per revolution; recalibrate after only one has landed
    let pipeline = Pipeline::new(scan_config(4, 4)).unwrap();
    calibrate(&pipeline);
    for i in 0..4 {
        pipeline.accept(projection(i)).unwrap();
    }
    assert!(pipeline.pump_all().is_empty(), "quarter revolution staged");

    // new dark/flat burst restarts acquisition
    calibrate(&pipeline);

    // the next revolution must need all four groups again, and its
    // sinogram must not carry any pre-recalibration columns
    for i in 0..16 {
        pipeline.accept(projection(i)).unwrap();
    }
    let updates = pipeline.pump_all();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].projections, 16);
    let sino = &updates[0].data;
    assert_close(&sino[..10], &SINO_HEAD);
    assert_close(&sino[sino.len() - 10..], &SINO_TAIL);
}

#[test]
fn alternating_previews_incorporate_full_revolutions() {
    let pipeline = Pipeline::new(scan_config(4, 4)).unwrap();
    calibrate(&pipeline);
    let mut updates = Vec::new();
    for rev in 0..3u32 {
        for i in 0..16 {
            pipeline.accept(projection(rev * 16 + i)).unwrap();
        }
        // the dispatch thread drains concurrently in production
        updates.extend(pipeline.pump_all());
    }
    assert_eq!(updates.len(), 3);
    for update in updates {
        assert_eq!(update.projections, 16);
    }
}

#[test]
fn continuous_updates_incorporate_one_group_each() {
    let mut config = scan_config(4, 4);
    config.pipeline.scan_mode = ScanMode::Continuous;
    let pipeline = Pipeline::new(config).unwrap();
    calibrate(&pipeline);
    for i in 0..16 {
        pipeline.accept(projection(i)).unwrap();
    }
    let updates = pipeline.pump_all();
    assert_eq!(updates.len(), 4);
    for update in updates {
        assert_eq!(update.projections, 4);
    }
}

#[test]
fn projections_before_calibration_are_counted_dropped() {
    let pipeline = Pipeline::new(scan_config(16, 2)).unwrap();
    pipeline.accept(projection(0)).unwrap();
    assert_eq!(pipeline.stats.dropped_uncalibrated.load(Ordering::Relaxed), 1);
    calibrate(&pipeline);
    pipeline.accept(projection(1)).unwrap();
    assert!(pipeline.pump(Duration::ZERO).is_none());
    assert_eq!(pipeline.stats.projections_accepted.load(Ordering::Relaxed), 1);
}

proptest! {
    /// Accepted projections balance against preprocessed plus
    /// explicitly dropped, once every staged group has completed.
    #[test]
    fn accounting_balances_for_shuffled_streams(
        seed in any::<u64>(),
        duplicates in proptest::collection::vec(0u32..16, 0..8),
    ) {
        let pipeline = Pipeline::new(scan_config(4, 4)).unwrap();
        calibrate(&pipeline);

        // deterministic shuffle of one revolution
        let mut order: Vec<u32> = (0..16).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        for &i in &order {
            pipeline.accept(projection(i)).unwrap();
        }
        for &i in &duplicates {
            pipeline.accept(projection(i)).unwrap();
        }
        pipeline.pump_all();

        let stats = &pipeline.stats;
        let accepted = stats.projections_accepted.load(Ordering::Relaxed);
        let preprocessed = stats.preprocessed.load(Ordering::Relaxed);
        let dropped = stats.dropped_stale.load(Ordering::Relaxed)
            + stats.dropped_evicted.load(Ordering::Relaxed);
        prop_assert_eq!(accepted, preprocessed + dropped);
    }
}
