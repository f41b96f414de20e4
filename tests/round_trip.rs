mod common;

use common::*;

use std::io::Cursor;

use anyhow::Result;
use siglog::{DataType, Reader, SignalDef, SignalKind, SourceDef, Writer};

#[test]
fn float_round_trip() -> Result<()> {
    let samples = noise(10_000);
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&small_fsr_signal(1, 1, DataType::F32))?;
    // odd block size so writes straddle chunk boundaries
    for (i, block) in samples.chunks(937).enumerate() {
        writer.fsr_f32(1, (i * 937) as i64, block)?;
    }
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    assert_eq!(reader.signal_length(1)?, 10_000);
    let back = reader.fsr(1, 0, 10_000)?;
    for (i, (b, s)) in back.iter().zip(samples.iter()).enumerate() {
        assert_eq!(*b, *s as f64, "sample {i}");
    }
    // a mid-file slice matches too
    let slice = reader.fsr(1, 4321, 500)?;
    for (i, b) in slice.iter().enumerate() {
        assert_eq!(*b, samples[4321 + i] as f64);
    }
    Ok(())
}

#[test]
fn packed_round_trips() -> Result<()> {
    let types = [
        DataType::U1,
        DataType::U4,
        DataType::I4,
        DataType::U8,
        DataType::I8,
        DataType::U16,
        DataType::I16,
        DataType::U24,
        DataType::I24,
        DataType::U32,
        DataType::I32,
        DataType::U64,
        DataType::I64,
        DataType::F32,
        DataType::F64,
    ];
    let n = 1000usize;
    for dt in types {
        let raw: Vec<u8> = (0..dt.bytes_for(n))
            .map(|i| ((i * 31 + 7) & 0xff) as u8)
            .collect();
        let mut bytes = Vec::new();
        let mut writer = Writer::new(Cursor::new(&mut bytes))?;
        writer.source_def(&SourceDef::new(1, "dev"))?;
        writer.signal_def(&small_fsr_signal(1, 1, dt))?;
        writer.fsr(1, 0, &raw, n)?;
        writer.finish()?;
        drop(writer);

        let mut reader = Reader::new(Cursor::new(bytes))?;
        let back = reader.fsr_raw(1, 0, n)?;
        assert_eq!(back, raw, "raw bytes for {dt:?}");

        let promoted = reader.fsr(1, 0, n)?;
        for i in 0..n {
            let expected = dt.read_sample(&raw, i);
            let actual = promoted[i];
            assert!(
                actual == expected || (actual.is_nan() && expected.is_nan()),
                "{dt:?} sample {i}: {actual} != {expected}"
            );
        }
    }
    Ok(())
}

#[test]
fn u1_reads_at_arbitrary_bit_offsets() -> Result<()> {
    // 0x6f repeated: LSB-first bit pattern 1,1,1,1,0,1,1,0 per byte
    let raw = vec![0x6fu8; 16];
    let n = 128;
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&small_fsr_signal(1, 1, DataType::U1))?;
    writer.fsr(1, 0, &raw, n)?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let pattern = [1.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0];
    for start in [0usize, 1, 3, 7, 11] {
        let slice = reader.fsr(1, start as i64, 16)?;
        for (i, v) in slice.iter().enumerate() {
            assert_eq!(*v, pattern[(start + i) % 8], "start {start} index {i}");
        }
        // raw reads re-align to bit 0 of the output
        let raw_slice = reader.fsr_raw(1, start as i64, 8)?;
        let expected: u8 = (0..8).fold(0, |acc, i| {
            acc | ((pattern[(start + i) % 8] as u8) << i)
        });
        assert_eq!(raw_slice, vec![expected], "raw at start {start}");
    }
    Ok(())
}

#[test]
fn sample_skip_reads_as_nan() -> Result<()> {
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&small_fsr_signal(1, 1, DataType::F32))?;
    writer.fsr_f32(1, 0, &vec![1.0; 1000])?;
    writer.fsr_f32(1, 2000, &vec![2.0; 1000])?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    assert_eq!(reader.signal_length(1)?, 3000);
    let back = reader.fsr(1, 0, 3000)?;
    for i in 0..1000 {
        assert_eq!(back[i], 1.0);
    }
    for i in 1000..2000 {
        assert!(back[i].is_nan(), "index {i} should be fill");
    }
    for i in 2000..3000 {
        assert_eq!(back[i], 2.0);
    }
    // statistics exclude the fill
    let stats = reader.fsr_statistics(1, 0, 3000, 1)?;
    assert_close(stats[0][0], 1.5, 1e-12, "mean across skip");
    assert_eq!(stats[0][2], 1.0);
    assert_eq!(stats[0][3], 2.0);
    Ok(())
}

#[test]
fn sample_skip_integer_bit_offsets() -> Result<()> {
    // ones written one sample at a time at scattered bit offsets
    let one_positions = [0i64, 3, 5, 10, 20, 2000, 2960];
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    let mut def = SignalDef::new(1, 1, SignalKind::Fsr, DataType::U1, 1000, "bits");
    def.samples_per_data = 4096;
    def.sample_decimate_factor = 1024;
    writer.signal_def(&def)?;
    for id in one_positions {
        writer.fsr(1, id, &[1u8], 1)?;
    }
    writer.fsr(1, 2961, &[0u8; 5], 39)?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    assert_eq!(reader.signal_length(1)?, 3000);
    let back = reader.fsr(1, 0, 3000)?;
    for (i, v) in back.iter().enumerate() {
        let expected = if one_positions.contains(&(i as i64)) {
            1.0
        } else {
            0.0
        };
        assert_eq!(*v, expected, "sample {i}");
    }
    // packed read starting at bit offset 3
    let raw = reader.fsr_raw(1, 3, 10)?;
    assert_eq!(raw, vec![0x85, 0x00]);
    Ok(())
}

#[test]
fn triangle_capture_end_to_end() -> Result<()> {
    // a long capture with default geometry: 937k samples at 100 kHz
    let samples = triangle(937_000);
    let t0 = siglog::time::seconds(1_000);
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(3, "instrument"))?;
    writer.signal_def(&SignalDef::new(
        5,
        3,
        SignalKind::Fsr,
        DataType::F32,
        100_000,
        "current",
    ))?;
    for (i, block) in samples.chunks(937).enumerate() {
        let sample_id = (i * 937) as i64;
        if i % 100 == 0 {
            // periodic anchors at the instrument rate of 100k samples/s
            let ts = t0 + (sample_id as i128 * siglog::time::SECOND as i128 / 100_000) as i64;
            writer.utc(5, sample_id, ts)?;
        }
        writer.fsr_f32(5, sample_id, block)?;
    }
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let sources = reader.sources();
    assert_eq!(sources.len(), 2); // implicit global + ours
    assert_eq!(sources[1].source_id, 3);
    let signals = reader.signals();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[1].signal_id, 5);
    assert_eq!(signals[1].sample_decimate_factor, 65_536);

    let head = reader.fsr(5, 0, 1000)?;
    for i in 0..1000 {
        assert_eq!(head[i], samples[i] as f64);
    }

    let stats = reader.fsr_statistics(5, 0, 10, 100)?;
    for index in [0usize, 99] {
        let window: Vec<f64> = samples[index * 10..(index + 1) * 10]
            .iter()
            .map(|s| *s as f64)
            .collect();
        let expected = direct_stats(&window);
        assert_close(stats[index][0], expected[0], 1e-9, "mean");
        assert_close(stats[index][1], expected[1], 1e-9, "std");
        assert_eq!(stats[index][2], expected[2]);
        assert_eq!(stats[index][3], expected[3]);
    }

    assert_eq!(reader.tmap_length(5)?, 10);
    assert_eq!(reader.sample_id_to_timestamp(5, 0)?, t0);
    Ok(())
}
