//! Rewrite a Log by replaying reads into a fresh writer.
//!
//! The destination gets the same sources, signals, user data, UTC anchors,
//! annotations and sample data, re-chunked with the source file's own
//! structural parameters. Regions that were skip-filled in the source are
//! replayed as stored (NaN for floats, zero for integers).

use std::path::Path;

use crate::read::Reader;
use crate::records::{Annotation, StorageType};
use crate::write::Writer;
use crate::SiglogResult;

/// Copy the Log at `src` to a new file at `dst`. `progress` receives
/// monotonically increasing values in `[0, 1]`.
pub fn copy<P: AsRef<Path>, Q: AsRef<Path>, F: FnMut(f64)>(
    src: P,
    dst: Q,
    mut progress: F,
) -> SiglogResult<()> {
    let mut reader = Reader::open(src)?;
    let mut writer = Writer::open(dst)?;

    for source in reader.sources() {
        if source.source_id != 0 {
            writer.source_def(&source)?;
        }
    }
    let signals = reader.signals();
    for def in &signals {
        if def.signal_id != 0 {
            writer.signal_def(def)?;
        }
    }

    let mut user_data: Vec<(u16, StorageType, Vec<u8>)> = Vec::new();
    reader.user_data(|meta, storage_type, payload| {
        user_data.push((meta, storage_type, payload.to_vec()));
        true
    })?;
    for (meta, storage_type, payload) in user_data {
        writer.user_data(meta, storage_type, &payload)?;
    }

    let total_samples: i64 = signals
        .iter()
        .map(|def| reader.signal_length(def.signal_id).unwrap_or(0))
        .sum();
    let mut copied: i64 = 0;
    progress(0.0);

    for def in &signals {
        let signal_id = def.signal_id;

        let tmap_len = reader.tmap_length(signal_id)?;
        for i in 0..tmap_len {
            let entry = reader.tmap_get(signal_id, i)?;
            writer.utc(signal_id, entry.sample_id, entry.timestamp)?;
        }

        let mut annotations: Vec<Annotation> = Vec::new();
        reader.annotations(signal_id, i64::MIN, |a| {
            annotations.push(a.clone());
            true
        })?;
        for a in annotations {
            writer.annotation(
                signal_id,
                a.timestamp,
                a.y,
                a.annotation_type,
                a.group_id,
                a.storage_type,
                &a.payload,
            )?;
        }

        let length = reader.signal_length(signal_id)?;
        if signal_id == 0 || length == 0 {
            continue;
        }
        if !reader.data_stored(signal_id)? {
            // summaries cannot be regenerated without the raw samples
            log::warn!("signal {signal_id}: data not stored in source; copying definitions only");
            writer.fsr_omit_data(signal_id, true)?;
            copied += length;
            continue;
        }

        let block = def.samples_per_data as i64;
        let offset = def.sample_id_offset;
        let mut pos: i64 = 0;
        while pos < length {
            let n = block.min(length - pos) as usize;
            let data = reader.fsr_raw(signal_id, offset + pos, n)?;
            writer.fsr(signal_id, offset + pos, &data, n)?;
            pos += n as i64;
            copied += n as i64;
            if total_samples > 0 {
                progress(copied as f64 / total_samples as f64);
            }
        }
    }

    writer.finish()?;
    progress(1.0);
    Ok(())
}
