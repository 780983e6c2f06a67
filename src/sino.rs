use tracing::debug;

use crate::config::ReconMode;
use crate::ring::CompletedGroup;

/// Transpose a group of projections from (projection, row, col) to
/// (row, projection, col) order.
pub fn projections_to_sino(
    group: &[f32],
    sino: &mut [f32],
    rows: usize,
    cols: usize,
    group_size: usize,
) {
    debug_assert_eq!(group.len(), group_size * rows * cols);
    debug_assert_eq!(sino.len(), group.len());
    for r in 0..rows {
        for g in 0..group_size {
            let src = g * rows * cols + r * cols;
            let dst = r * group_size * cols + g * cols;
            sino[dst..dst + cols].copy_from_slice(&group[src..src + cols]);
        }
    }
}

/// Angular spans touched by one update, inclusive on both ends. Two
/// spans occur when a continuous-mode window wraps the revolution.
#[derive(Clone, Debug, PartialEq)]
pub struct SinogramUpdate {
    pub spans: Vec<(u32, u32)>,
    /// Projections newly incorporated by this update.
    pub projections: u32,
    /// Snapshot of the host sinogram, shape (rows, num_projections, cols).
    pub data: Vec<f32>,
}

/// Assembles preprocessed groups into the host-side sinogram of one
/// revolution.
///
/// Alternating mode collects a whole revolution and then emits one
/// full-buffer update; continuous mode emits a sliding-window update
/// per group, overwriting the oldest angular range in place.
pub struct SinogramAssembler {
    rows: usize,
    cols: usize,
    group_size: usize,
    num_projections: usize,
    mode: ReconMode,
    host: Vec<f32>,
    groups_filled: usize,
    update_count: u64,
}

impl SinogramAssembler {
    pub fn new(
        rows: u32,
        cols: u32,
        group_size: u32,
        num_projections: u32,
        mode: ReconMode,
    ) -> Self {
        let size = rows as usize * num_projections as usize * cols as usize;
        Self {
            rows: rows as usize,
            cols: cols as usize,
            group_size: group_size as usize,
            num_projections: num_projections as usize,
            mode,
            host: vec![0.0; size],
            groups_filled: 0,
            update_count: 0,
        }
    }

    /// Transpose one preprocessed group into the revolution buffer.
    /// Returns the update to hand to the uploader, when one is due.
    pub fn append(&mut self, group: &CompletedGroup) -> Option<SinogramUpdate> {
        let begin = match self.mode {
            ReconMode::Alternating => {
                let groups_per_rev = self.num_projections / self.group_size;
                (group.generation as usize % groups_per_rev) * self.group_size
            }
            ReconMode::Continuous => {
                (self.update_count as usize * self.group_size) % self.num_projections
            }
        };
        self.transpose_at(&group.data, begin);
        self.update_count += 1;

        match self.mode {
            ReconMode::Alternating => {
                self.groups_filled += 1;
                if self.groups_filled * self.group_size == self.num_projections {
                    self.groups_filled = 0;
                    debug!(generation = group.generation, "revolution assembled");
                    Some(SinogramUpdate {
                        spans: vec![(0, self.num_projections as u32 - 1)],
                        projections: self.num_projections as u32,
                        data: self.host.clone(),
                    })
                } else {
                    None
                }
            }
            ReconMode::Continuous => {
                let end = begin + self.group_size - 1;
                let spans = if end < self.num_projections {
                    vec![(begin as u32, end as u32)]
                } else {
                    // window wraps the end of the revolution
                    vec![
                        (begin as u32, self.num_projections as u32 - 1),
                        (0, (end % self.num_projections) as u32),
                    ]
                };
                Some(SinogramUpdate {
                    spans,
                    projections: self.group_size as u32,
                    data: self.host.clone(),
                })
            }
        }
    }

    /// Discard partial assembly state. Called when a dark/flat burst
    /// restarts acquisition, so a fresh revolution never mixes with
    /// columns staged before the recalibration.
    pub fn reset(&mut self) {
        self.groups_filled = 0;
        self.update_count = 0;
        self.host.fill(0.0);
    }

    /// Host sinogram, shape (rows, num_projections, cols).
    pub fn sinogram(&self) -> &[f32] {
        &self.host
    }

    fn transpose_at(&mut self, group: &[f32], begin: usize) {
        let n = self.num_projections;
        for r in 0..self.rows {
            for g in 0..self.group_size {
                let angle = (begin + g) % n;
                let src = g * self.rows * self.cols + r * self.cols;
                let dst = r * n * self.cols + angle * self.cols;
                self.host[dst..dst + self.cols].copy_from_slice(&group[src..src + self.cols]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(generation: u64, group_size: usize, rows: usize, cols: usize) -> CompletedGroup {
        // value encodes (projection, row, col) for round-trip checks
        let mut data = Vec::with_capacity(group_size * rows * cols);
        for g in 0..group_size {
            for r in 0..rows {
                for c in 0..cols {
                    data.push((g * 100 + r * 10 + c) as f32);
                }
            }
        }
        CompletedGroup { generation, data }
    }

    #[test]
    fn transpose_round_trip() {
        let (rows, cols, group_size) = (3, 4, 5);
        let g = group(0, group_size, rows, cols);
        let mut sino = vec![0.0; g.data.len()];
        projections_to_sino(&g.data, &mut sino, rows, cols, group_size);
        for r in 0..rows {
            for p in 0..group_size {
                for c in 0..cols {
                    assert_eq!(
                        sino[r * group_size * cols + p * cols + c],
                        g.data[p * rows * cols + r * cols + c],
                        "({r},{p},{c})"
                    );
                }
            }
        }
    }

    #[test]
    fn alternating_emits_after_full_revolution() {
        let mut assembler = SinogramAssembler::new(2, 3, 2, 4, ReconMode::Alternating);
        assert!(assembler.append(&group(0, 2, 2, 3)).is_none());
        let update = assembler.append(&group(1, 2, 2, 3)).unwrap();
        assert_eq!(update.spans, vec![(0, 3)]);
        assert_eq!(update.projections, 4);

        // generation 1 landed at angles 2..=3
        let sino = update.data;
        // row 0, angle 2, col 0 == projection 0 of generation 1
        assert_eq!(sino[2 * 3], 0.0);
        // row 0, angle 3, col 1 == projection 1, row 0, col 1
        assert_eq!(sino[3 * 3 + 1], 101.0);
    }

    #[test]
    fn alternating_overwrites_next_revolution() {
        let mut assembler = SinogramAssembler::new(1, 1, 1, 2, ReconMode::Alternating);
        let make = |generation, v: f32| CompletedGroup {
            generation,
            data: vec![v],
        };
        assert!(assembler.append(&make(0, 1.0)).is_none());
        let first = assembler.append(&make(1, 2.0)).unwrap();
        assert_eq!(first.data, vec![1.0, 2.0]);
        // next revolution replaces in place, generation modulo maps home
        assert!(assembler.append(&make(2, 3.0)).is_none());
        let second = assembler.append(&make(3, 4.0)).unwrap();
        assert_eq!(second.data, vec![3.0, 4.0]);
    }

    #[test]
    fn reset_discards_partial_revolution() {
        let mut assembler = SinogramAssembler::new(1, 1, 2, 4, ReconMode::Alternating);
        let make = |generation, v: f32| CompletedGroup {
            generation,
            data: vec![v, v],
        };
        // half a revolution staged, then acquisition restarts
        assert!(assembler.append(&make(0, 9.0)).is_none());
        assembler.reset();
        assert!(assembler.sinogram().iter().all(|&v| v == 0.0));

        // the fresh revolution must need two full groups again
        assert!(assembler.append(&make(0, 1.0)).is_none());
        let update = assembler.append(&make(1, 2.0)).unwrap();
        assert_eq!(update.projections, 4);
        assert_eq!(update.data, vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn reset_rewinds_continuous_cursor() {
        let mut assembler = SinogramAssembler::new(1, 1, 2, 6, ReconMode::Continuous);
        let make = |v: f32| CompletedGroup {
            generation: 0,
            data: vec![v, v],
        };
        assert_eq!(assembler.append(&make(1.0)).unwrap().spans, vec![(0, 1)]);
        assert_eq!(assembler.append(&make(2.0)).unwrap().spans, vec![(2, 3)]);
        assembler.reset();
        // window restarts at the first angular span
        assert_eq!(assembler.append(&make(3.0)).unwrap().spans, vec![(0, 1)]);
    }

    #[test]
    fn continuous_slides_and_wraps() {
        let mut assembler = SinogramAssembler::new(1, 1, 2, 6, ReconMode::Continuous);
        let make = |v: f32| CompletedGroup {
            generation: 0,
            data: vec![v, v + 0.5],
        };
        let u0 = assembler.append(&make(1.0)).unwrap();
        assert_eq!(u0.spans, vec![(0, 1)]);
        assert_eq!(u0.projections, 2);
        let u1 = assembler.append(&make(2.0)).unwrap();
        assert_eq!(u1.spans, vec![(2, 3)]);
        let u2 = assembler.append(&make(3.0)).unwrap();
        assert_eq!(u2.spans, vec![(4, 5)]);
        // fourth update wraps back to the start
        let u3 = assembler.append(&make(4.0)).unwrap();
        assert_eq!(u3.spans, vec![(0, 1)]);
        assert_eq!(u3.data[0], 4.0);
        assert_eq!(u3.data[2], 2.0, "untouched angles keep old data");
    }

    #[test]
    fn continuous_wrapping_span_splits_in_two() {
        let mut assembler = SinogramAssembler::new(1, 1, 4, 6, ReconMode::Continuous);
        let make = || CompletedGroup {
            generation: 0,
            data: vec![1.0; 4],
        };
        assert_eq!(assembler.append(&make()).unwrap().spans, vec![(0, 3)]);
        // second window covers angles 4,5,0,1
        assert_eq!(
            assembler.append(&make()).unwrap().spans,
            vec![(4, 5), (0, 1)]
        );
    }
}
