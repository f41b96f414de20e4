mod common;

use common::*;

use std::io::Cursor;

use anyhow::Result;
use siglog::{
    time, AnnotationType, DataType, Reader, SiglogError, SignalDef, SignalKind, SourceDef,
    StorageType, Writer,
};

#[test]
fn annotation_types_and_from_filter() -> Result<()> {
    let now = time::seconds(86_400);
    let kinds = [
        (AnnotationType::Text, StorageType::String, &b"note"[..]),
        (AnnotationType::Vmarker, StorageType::String, &b"1a"[..]),
        (AnnotationType::User, StorageType::Binary, &[0u8, 1, 2][..]),
        (AnnotationType::User, StorageType::String, &b"hello"[..]),
        (AnnotationType::User, StorageType::Json, &br#"{"a":1}"#[..]),
    ];

    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    for (i, (annotation_type, storage_type, payload)) in kinds.iter().enumerate() {
        writer.annotation(
            0,
            now + time::milliseconds(i as i64),
            f32::NAN,
            *annotation_type,
            i as u8,
            *storage_type,
            payload,
        )?;
    }
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let mut seen = Vec::new();
    reader.annotations(0, 0, |a| {
        seen.push((a.timestamp, a.annotation_type, a.storage_type, a.payload.clone()));
        true
    })?;
    assert_eq!(seen.len(), 5);
    for (i, (ts, annotation_type, storage_type, payload)) in seen.iter().enumerate() {
        assert_eq!(*ts, now + time::milliseconds(i as i64));
        assert_eq!(*annotation_type, kinds[i].0);
        assert_eq!(*storage_type, kinds[i].1);
        assert_eq!(payload.as_slice(), kinds[i].2);
    }

    // from-filter delivers only annotations at or after the bound
    let mut tail = Vec::new();
    reader.annotations(0, now + time::milliseconds(2), |a| {
        tail.push(a.timestamp);
        true
    })?;
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0], now + time::milliseconds(2));

    // callback stop
    let mut count = 0;
    reader.annotations(0, 0, |_| {
        count += 1;
        false
    })?;
    assert_eq!(count, 1);
    Ok(())
}

#[test]
fn fsr_annotations_keyed_by_sample_id() -> Result<()> {
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&small_fsr_signal(1, 1, DataType::F32))?;
    writer.fsr_f32(1, 0, &noise(256))?;
    writer.annotation(1, 100, 0.5, AnnotationType::Hmarker, 0, StorageType::Binary, &[])?;
    writer.annotation(1, 200, f32::NAN, AnnotationType::Text, 1, StorageType::String, b"x")?;
    // out of order is rejected, state intact
    assert!(matches!(
        writer.annotation(1, 150, 0.0, AnnotationType::Text, 0, StorageType::String, b"y"),
        Err(SiglogError::ParameterInvalid(_))
    ));
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let mut seen = Vec::new();
    reader.annotations(1, 150, |a| {
        seen.push(a.timestamp);
        true
    })?;
    assert_eq!(seen, vec![200]);
    Ok(())
}

#[test]
fn user_data_in_write_order() -> Result<()> {
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.user_data(0x0123, StorageType::Binary, &[0u8; 11])?;
    writer.user_data(0x0bee, StorageType::String, b"hello world")?;
    writer.user_data(0x0abc, StorageType::Json, br#"{"hello":"world"}"#)?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let mut seen = Vec::new();
    reader.user_data(|meta, storage_type, payload| {
        seen.push((meta, storage_type, payload.to_vec()));
        true
    })?;
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], (0x0123, StorageType::Binary, vec![0u8; 11]));
    assert_eq!(seen[1], (0x0bee, StorageType::String, b"hello world".to_vec()));
    assert_eq!(
        seen[2],
        (0x0abc, StorageType::Json, br#"{"hello":"world"}"#.to_vec())
    );

    // early stop
    let mut first = None;
    reader.user_data(|meta, _, _| {
        first = Some(meta);
        false
    })?;
    assert_eq!(first, Some(0x0123));
    Ok(())
}

#[test]
fn duplicate_definitions_rejected() -> Result<()> {
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(2, "dev"))?;
    assert!(matches!(
        writer.source_def(&SourceDef::new(2, "dev")),
        Err(SiglogError::AlreadyExists(_))
    ));
    let def = SignalDef::new(7, 2, SignalKind::Fsr, DataType::F32, 1000, "s");
    writer.signal_def(&def)?;
    assert!(matches!(
        writer.signal_def(&def),
        Err(SiglogError::AlreadyExists(_))
    ));
    // the file is still healthy
    writer.fsr_f32(7, 0, &[1.0, 2.0, 3.0])?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    assert_eq!(reader.signal_length(7)?, 3);
    assert_eq!(reader.fsr(7, 0, 3)?, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn utc_duplicates_rejected() -> Result<()> {
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&small_fsr_signal(1, 1, DataType::F32))?;
    writer.utc(1, 0, time::seconds(5))?;
    assert!(matches!(
        writer.utc(1, 0, time::seconds(6)),
        Err(SiglogError::ParameterInvalid(_))
    ));
    writer.utc(1, 1000, time::seconds(6))?;
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    assert_eq!(reader.tmap_length(1)?, 2);
    Ok(())
}

#[test]
fn utc_iteration_from_sample_id() -> Result<()> {
    let mut def = small_fsr_signal(1, 1, DataType::F32);
    def.utc_decimate_factor = 4;
    let mut bytes = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut bytes))?;
    writer.source_def(&SourceDef::new(1, "dev"))?;
    writer.signal_def(&def)?;
    for k in 0..10i64 {
        writer.utc(1, k * 100, time::seconds(k))?;
    }
    writer.finish()?;
    drop(writer);

    let mut reader = Reader::new(Cursor::new(bytes))?;
    let mut seen = Vec::new();
    reader.utc(1, 450, |e| {
        seen.push(e.sample_id);
        true
    })?;
    assert_eq!(seen, vec![500, 600, 700, 800, 900]);
    Ok(())
}
