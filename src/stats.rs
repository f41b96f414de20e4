//! Streaming summary statistics.
//!
//! Welford's online algorithm for mean/variance, with min/max tracked on the
//! side and an O(1) [`merge`](SummaryAccum::merge) so the reader can combine
//! whole summary entries with exactly recomputed window edges.

use crate::records::SummaryEntry;

/// Accumulates `(count, mean, m2, min, max)` over a stream of samples.
///
/// NaN samples are treated as invalid and excluded from the count; a window
/// that only ever saw NaN finalizes to an all-NaN [`SummaryEntry`].
#[derive(Debug, Clone, Copy)]
pub struct SummaryAccum {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for SummaryAccum {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryAccum {
    pub fn new() -> SummaryAccum {
        SummaryAccum {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, x: f64) {
        if x.is_nan() {
            return;
        }
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    /// Combine another accumulator into this one (Chan et al. parallel
    /// variance update).
    pub fn merge(&mut self, other: &SummaryAccum) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = other.mean - self.mean;
        self.mean += delta * n2 / n;
        self.m2 += other.m2 + delta * delta * n1 * n2 / n;
        self.count += other.count;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.mean
        }
    }

    /// Population standard deviation.
    pub fn std(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            (self.m2 / self.count as f64).max(0.0).sqrt()
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.max
        }
    }

    /// Finalize into the on-disk entry form.
    pub fn entry(&self) -> SummaryEntry {
        SummaryEntry {
            mean: self.mean(),
            std: self.std(),
            min: self.min(),
            max: self.max(),
        }
    }

    /// Rebuild an accumulator from a stored entry and the number of valid
    /// samples it covered.
    pub fn from_entry(entry: &SummaryEntry, count: u64) -> SummaryAccum {
        if count == 0 || entry.mean.is_nan() {
            return SummaryAccum::new();
        }
        SummaryAccum {
            count,
            mean: entry.mean,
            m2: entry.std * entry.std * count as f64,
            min: entry.min,
            max: entry.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(samples: &[f64]) -> (f64, f64, f64, f64) {
        let valid: Vec<f64> = samples.iter().copied().filter(|x| !x.is_nan()).collect();
        let n = valid.len() as f64;
        let mean = valid.iter().sum::<f64>() / n;
        let var = valid.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
        let max = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (mean, var.sqrt(), min, max)
    }

    #[test]
    fn matches_direct_computation() {
        let samples: Vec<f64> = (0..1000).map(|i| ((i * 7919) % 1000) as f64 / 10.0).collect();
        let mut acc = SummaryAccum::new();
        for s in &samples {
            acc.add(*s);
        }
        let (mean, std, min, max) = direct(&samples);
        assert!((acc.mean() - mean).abs() < 1e-9);
        assert!((acc.std() - std).abs() < 1e-9);
        assert_eq!(acc.min(), min);
        assert_eq!(acc.max(), max);
        assert_eq!(acc.count(), 1000);
    }

    #[test]
    fn merge_equals_sequential() {
        let samples: Vec<f64> = (0..500).map(|i| (i as f64).sin() * 3.0 + 1.0).collect();
        let mut whole = SummaryAccum::new();
        for s in &samples {
            whole.add(*s);
        }
        let mut a = SummaryAccum::new();
        let mut b = SummaryAccum::new();
        for s in &samples[..137] {
            a.add(*s);
        }
        for s in &samples[137..] {
            b.add(*s);
        }
        a.merge(&b);
        assert_eq!(a.count(), whole.count());
        assert!((a.mean() - whole.mean()).abs() < 1e-12);
        assert!((a.std() - whole.std()).abs() < 1e-12);
        assert_eq!(a.min(), whole.min());
        assert_eq!(a.max(), whole.max());
    }

    #[test]
    fn merge_with_empty() {
        let mut a = SummaryAccum::new();
        a.add(1.0);
        a.add(3.0);
        let empty = SummaryAccum::new();
        let mut b = a;
        b.merge(&empty);
        assert_eq!(b.count(), 2);
        assert_eq!(b.mean(), 2.0);

        let mut c = SummaryAccum::new();
        c.merge(&a);
        assert_eq!(c.count(), 2);
        assert_eq!(c.mean(), 2.0);
    }

    #[test]
    fn nan_is_excluded() {
        let mut acc = SummaryAccum::new();
        acc.add(f64::NAN);
        acc.add(2.0);
        acc.add(f64::NAN);
        acc.add(4.0);
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.mean(), 3.0);
        assert_eq!(acc.min(), 2.0);
        assert_eq!(acc.max(), 4.0);
    }

    #[test]
    fn empty_finalizes_to_nan_entry() {
        let entry = SummaryAccum::new().entry();
        assert!(entry.mean.is_nan());
        assert!(entry.std.is_nan());
        assert!(entry.min.is_nan());
        assert!(entry.max.is_nan());
    }

    #[test]
    fn entry_round_trip() {
        let mut acc = SummaryAccum::new();
        for i in 0..100 {
            acc.add(i as f64 * 0.25);
        }
        let rebuilt = SummaryAccum::from_entry(&acc.entry(), acc.count());
        assert!((rebuilt.mean() - acc.mean()).abs() < 1e-12);
        assert!((rebuilt.std() - acc.std()).abs() < 1e-9);
        assert_eq!(rebuilt.min(), acc.min());
        assert_eq!(rebuilt.max(), acc.max());
    }
}
