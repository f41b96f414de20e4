#![allow(dead_code)]

use siglog::{DataType, SignalDef, SignalKind};

/// A small summary-tree geometry so a few thousand samples exercise
/// multiple cascade levels and chunk flushes.
pub fn small_fsr_signal(signal_id: u16, source_id: u16, dt: DataType) -> SignalDef {
    let mut def = SignalDef::new(signal_id, source_id, SignalKind::Fsr, dt, 1000, "test");
    def.samples_per_data = 64;
    def.sample_decimate_factor = 16;
    def.entries_per_summary = 8;
    def.summary_decimate_factor = 4;
    def
}

/// Deterministic noise in [0, 100).
pub fn noise(n: usize) -> Vec<f32> {
    let mut state = 0x2545_f491u32;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 16) as f32 % 100.0
        })
        .collect()
}

/// A 1000-sample-period triangle wave.
pub fn triangle(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let t = (i % 1000) as f32;
            if t < 500.0 {
                t
            } else {
                1000.0 - t
            }
        })
        .collect()
}

pub fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Population statistics computed the obvious way, NaN excluded.
pub fn direct_stats(samples: &[f64]) -> [f64; 4] {
    let valid: Vec<f64> = samples.iter().copied().filter(|x| !x.is_nan()).collect();
    if valid.is_empty() {
        return [f64::NAN; 4];
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let var = valid.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    let min = valid.iter().copied().fold(f64::INFINITY, f64::min);
    let max = valid.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    [mean, var.sqrt(), min, max]
}

pub fn assert_close(actual: f64, expected: f64, tolerance: f64, what: &str) {
    if expected.is_nan() {
        assert!(actual.is_nan(), "{what}: expected NaN, got {actual}");
        return;
    }
    let scale = expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tolerance * scale,
        "{what}: {actual} != {expected}"
    );
}
