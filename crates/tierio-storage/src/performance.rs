//! Per-backend latency model
//!
//! Keeps an integer exponential moving average and mean absolute deviation
//! of read and write latency, normalized to nanoseconds per KiB. The window
//! is `W = 1 << shift` samples:
//!
//! ```text
//! total = avg * (W - 1) + sample + rem
//! rem   = total & (W - 1)
//! avg   = total >> shift
//! ```
//!
//! The remainder carries the bits lost by the shift into the next update, so
//! a constant input converges exactly. The model only ranks backends; no
//! correctness property depends on it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tierio_common::Direction;
use tracing::{debug, trace};

/// Default averaging window shift (32 samples)
pub const DEFAULT_MEASURE_SHIFT: u32 = 5;

/// Moving average and deviation of one transfer direction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovingAverage {
    /// Average latency in ns/KiB (`0` = no sample yet)
    pub avg: u64,
    /// Bits of the average lost to the last shift
    pub avg_rem: u64,
    /// Mean absolute deviation in ns/KiB
    pub stdev: u64,
    /// Bits of the deviation lost to the last shift
    pub stdev_rem: u64,
}

impl MovingAverage {
    /// Feed one sample. Returns the absolute difference to the previous
    /// average (`0` for the seeding sample).
    fn update(&mut self, sample: u64, shift: u32) -> u64 {
        if self.avg == 0 {
            self.avg = sample;
            return 0;
        }

        let diff = self.avg.abs_diff(sample);
        (self.avg, self.avg_rem) = fold(self.avg, self.avg_rem, sample, shift);
        (self.stdev, self.stdev_rem) = fold(self.stdev, self.stdev_rem, diff, shift);
        diff
    }

    /// Whether at least one sample was recorded
    #[must_use]
    pub const fn is_seeded(&self) -> bool {
        self.avg != 0
    }
}

#[allow(clippy::cast_possible_truncation)]
fn fold(value: u64, rem: u64, sample: u64, shift: u32) -> (u64, u64) {
    let mask = (1u128 << shift) - 1;
    let total = u128::from(value) * mask + u128::from(sample) + u128::from(rem);
    let new_rem = (total & mask) as u64;
    let new_value = (total >> shift).min(u128::from(u64::MAX)) as u64;
    (new_value, new_rem)
}

/// Snapshot of a backend's performance, as stored in its header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub read: MovingAverage,
    pub write: MovingAverage,
}

/// Latency model of one backend
#[derive(Clone, Debug)]
pub struct PerformanceModel {
    shift: u32,
    record: PerformanceRecord,
}

impl Default for PerformanceModel {
    fn default() -> Self {
        Self::new(DEFAULT_MEASURE_SHIFT)
    }
}

impl PerformanceModel {
    #[must_use]
    pub fn new(shift: u32) -> Self {
        Self {
            shift: shift.clamp(1, 16),
            record: PerformanceRecord::default(),
        }
    }

    /// Restore a model from a persisted snapshot
    #[must_use]
    pub fn with_record(shift: u32, record: PerformanceRecord) -> Self {
        let mut model = Self::new(shift);
        model.record = record;
        model
    }

    /// Record the latency of a transfer of `bytes` bytes
    pub fn update(&mut self, direction: Direction, latency: Duration, bytes: usize) {
        self.update_sample(direction, per_kib(latency, bytes));
    }

    /// Record a latency already normalized to ns/KiB
    pub fn update_sample(&mut self, direction: Direction, sample: u64) {
        // a zero sample would look like "unseeded"
        let sample = sample.max(1);
        let entry = match direction {
            Direction::Read => &mut self.record.read,
            Direction::Write => &mut self.record.write,
        };

        let seeding = !entry.is_seeded();
        let previous = entry.avg;
        let diff = entry.update(sample, self.shift);

        if seeding {
            debug!("seeded {direction:?} performance with {sample} ns/KiB");
        } else if diff > previous {
            trace!("high {direction:?} latency deviation: avg={previous} current={sample} ns/KiB");
        }
    }

    /// Ranking score, lower is faster
    #[must_use]
    pub const fn rank_score(&self) -> u64 {
        let read = self.record.read.avg;
        let write = self.record.write.avg;
        read / 2 + write / 2 + (read % 2 + write % 2) / 2
    }

    #[must_use]
    pub const fn record(&self) -> PerformanceRecord {
        self.record
    }

    #[must_use]
    pub const fn shift(&self) -> u32 {
        self.shift
    }
}

/// Normalize a transfer latency to nanoseconds per KiB
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn per_kib(latency: Duration, bytes: usize) -> u64 {
    let bytes = bytes.max(1) as u128;
    let ns = latency.as_nanos().saturating_mul(1024) / bytes;
    ns.min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_seeds() {
        let mut model = PerformanceModel::new(5);
        model.update_sample(Direction::Read, 1000);
        assert_eq!(model.record().read.avg, 1000);
        assert_eq!(model.record().read.stdev, 0);
        assert!(!model.record().write.is_seeded());
    }

    #[test]
    fn test_constant_input_is_stable() {
        let mut model = PerformanceModel::new(5);
        for _ in 0..100 {
            model.update_sample(Direction::Write, 777);
        }
        let write = model.record().write;
        assert_eq!(write.avg, 777);
        assert_eq!(write.stdev, 0);
        assert_eq!(write.avg_rem, 0);
    }

    #[test]
    fn test_average_moves_towards_samples() {
        let mut model = PerformanceModel::new(5);
        model.update_sample(Direction::Read, 100);
        model.update_sample(Direction::Read, 4100);
        // (100 * 31 + 4100) / 32 = 225, remainder 0
        assert_eq!(model.record().read.avg, 225);
        // (0 * 31 + 4000) / 32 = 125
        assert_eq!(model.record().read.stdev, 125);

        for _ in 0..500 {
            model.update_sample(Direction::Read, 4100);
        }
        let read = model.record().read.avg;
        assert!((4090..=4100).contains(&read), "avg {read}");
    }

    #[test]
    fn test_remainder_carries() {
        let mut model = PerformanceModel::new(1);
        model.update_sample(Direction::Read, 10);
        model.update_sample(Direction::Read, 11);
        // (10 + 11) = 21 -> avg 10, rem 1
        assert_eq!(model.record().read.avg, 10);
        assert_eq!(model.record().read.avg_rem, 1);
        model.update_sample(Direction::Read, 11);
        // (10 + 11 + 1) = 22 -> avg 11, rem 0
        assert_eq!(model.record().read.avg, 11);
        assert_eq!(model.record().read.avg_rem, 0);
    }

    #[test]
    fn test_rank_score() {
        let mut fast = PerformanceModel::default();
        let mut slow = PerformanceModel::default();
        fast.update_sample(Direction::Read, 10);
        fast.update_sample(Direction::Write, 30);
        slow.update_sample(Direction::Read, 1000);
        slow.update_sample(Direction::Write, 3000);
        assert_eq!(fast.rank_score(), 20);
        assert!(fast.rank_score() < slow.rank_score());
    }

    #[test]
    fn test_per_kib() {
        assert_eq!(per_kib(Duration::from_micros(1), 1024), 1000);
        assert_eq!(per_kib(Duration::from_micros(1), 4096), 250);
        assert_eq!(per_kib(Duration::from_nanos(5), 0), 5120);
    }

    #[test]
    fn test_restore_snapshot() {
        let mut model = PerformanceModel::new(5);
        model.update_sample(Direction::Read, 42);
        let restored = PerformanceModel::with_record(5, model.record());
        assert_eq!(restored.rank_score(), model.rank_score());
    }
}
