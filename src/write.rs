//! Write SigLog files.
//!
//! [`Writer`] is the synchronous façade: definitions, samples, annotations,
//! UTC anchors and user data go in; chunks come out in arrival order. For a
//! producer that must not block on disk I/O, see [`crate::threaded`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use crate::chunk::ChunkWriter;
use crate::data_type::DataType;
use crate::records::{
    self, chunk_meta, tag, Annotation, AnnotationType, EndPayload, SignalDef, SignalKind,
    SignalLength, SourceDef, StorageType, UserDataPayload,
};
use crate::track::Track;
use crate::{time, SiglogError, SiglogResult, WriterFlags, MAX_SIGNAL_ID};

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub(crate) flags: WriterFlags,
    pub(crate) ring_capacity: usize,
    pub(crate) creation_time: Option<i64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            flags: WriterFlags::default(),
            ring_capacity: 1024,
            creation_time: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial writer flags.
    pub fn flags(self, flags: WriterFlags) -> Self {
        Self { flags, ..self }
    }

    /// Command ring capacity for [`crate::ThreadedWriter`]; ignored by the
    /// synchronous [`Writer`].
    pub fn ring_capacity(self, ring_capacity: usize) -> Self {
        Self {
            ring_capacity,
            ..self
        }
    }

    /// Override the creation time recorded in the file header; defaults to
    /// the current wall clock.
    pub fn creation_time(self, creation_time: i64) -> Self {
        Self {
            creation_time: Some(creation_time),
            ..self
        }
    }

    /// Creates a [`Writer`] which writes to `w` using the given options.
    pub fn create<W: Write + Seek>(self, w: W) -> SiglogResult<Writer<W>> {
        Writer::with_options(w, self)
    }
}

/// Writes a SigLog file to the given [writer](Write).
///
/// Users should call [`finish()`](Self::finish) to flush the stream
/// and check for errors when done; otherwise the result will be unwrapped
/// on drop.
pub struct Writer<W: Write + Seek> {
    chunks: ChunkWriter<W>,
    sources: BTreeMap<u16, SourceDef>,
    tracks: BTreeMap<u16, Track>,
    flags: WriterFlags,
    finished: bool,
}

impl Writer<BufWriter<File>> {
    /// Create (truncating) the file at `path` and write its header.
    pub fn open<P: AsRef<Path>>(path: P) -> SiglogResult<Self> {
        Writer::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write + Seek> Writer<W> {
    pub fn new(w: W) -> SiglogResult<Self> {
        Self::with_options(w, WriteOptions::default())
    }

    pub fn with_options(w: W, options: WriteOptions) -> SiglogResult<Self> {
        let creation_time = options.creation_time.unwrap_or_else(time::now);
        let chunks = ChunkWriter::new(w, creation_time)?;
        let mut sources = BTreeMap::new();
        sources.insert(0, SourceDef::global());
        let mut tracks = BTreeMap::new();
        tracks.insert(0, Track::new(SignalDef::global()));
        Ok(Writer {
            chunks,
            sources,
            tracks,
            flags: options.flags,
            finished: false,
        })
    }

    fn check_open(&self) -> SiglogResult<()> {
        if self.finished {
            Err(SiglogError::Abort("writer already finished".into()))
        } else {
            Ok(())
        }
    }

    pub fn flags(&self) -> WriterFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: WriterFlags) {
        self.flags = flags;
    }

    /// Define a source. Must precede any signal referencing it.
    pub fn source_def(&mut self, def: &SourceDef) -> SiglogResult<()> {
        self.check_open()?;
        if def.source_id == 0 {
            return Err(SiglogError::ParameterInvalid(
                "source_id 0 is reserved".into(),
            ));
        }
        if self.sources.contains_key(&def.source_id) {
            return Err(SiglogError::AlreadyExists(format!(
                "source {}",
                def.source_id
            )));
        }
        self.chunks
            .write_chunk(tag::SOURCE_DEF, def.source_id, &records::to_vec(def)?)?;
        self.sources.insert(def.source_id, def.clone());
        Ok(())
    }

    /// Define a signal. Zero structural parameters are auto-filled; the
    /// resolved definition is what lands on disk and cannot change later.
    pub fn signal_def(&mut self, def: &SignalDef) -> SiglogResult<()> {
        self.check_open()?;
        if def.signal_id == 0 || def.signal_id > MAX_SIGNAL_ID {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal_id {} out of range 1..=255",
                def.signal_id
            )));
        }
        if self.tracks.contains_key(&def.signal_id) {
            return Err(SiglogError::AlreadyExists(format!(
                "signal {}",
                def.signal_id
            )));
        }
        if !self.sources.contains_key(&def.source_id) {
            return Err(SiglogError::NotFound(format!("source {}", def.source_id)));
        }
        let mut resolved = def.clone();
        resolved.resolve_defaults()?;
        self.chunks.write_chunk(
            tag::SIGNAL_DEF,
            chunk_meta(resolved.signal_id, 0),
            &records::to_vec(&resolved)?,
        )?;
        self.tracks.insert(resolved.signal_id, Track::new(resolved));
        Ok(())
    }

    /// Append an opaque user-data record; `user_meta` is returned verbatim
    /// on read.
    pub fn user_data(
        &mut self,
        user_meta: u16,
        storage_type: StorageType,
        payload: &[u8],
    ) -> SiglogResult<()> {
        self.check_open()?;
        let record = UserDataPayload {
            storage_type,
            payload: payload.to_vec(),
        };
        self.chunks
            .write_chunk(tag::USER_DATA, user_meta, &records::to_vec(&record)?)?;
        Ok(())
    }

    /// Append `samples` packed samples at `sample_id`. The id must be at
    /// least the signal's next expected id; a greater id records a skip.
    pub fn fsr(
        &mut self,
        signal_id: u16,
        sample_id: i64,
        data: &[u8],
        samples: usize,
    ) -> SiglogResult<()> {
        self.check_open()?;
        let track = self
            .tracks
            .get_mut(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        if track.def.kind != SignalKind::Fsr {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal {signal_id} is not an FSR signal"
            )));
        }
        if data.len() != track.def.data_type.bytes_for(samples) {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal {signal_id}: {} bytes cannot hold {samples} samples",
                data.len()
            )));
        }
        if samples == 0 {
            return Ok(());
        }
        let rel = sample_id - track.def.sample_id_offset;
        if rel < 0 {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal {signal_id}: sample_id {sample_id} is before the signal's offset"
            )));
        }
        track.write_fsr(&mut self.chunks, rel, data, samples)
    }

    /// Convenience for F32 signals.
    pub fn fsr_f32(&mut self, signal_id: u16, sample_id: i64, samples: &[f32]) -> SiglogResult<()> {
        {
            let track = self
                .tracks
                .get(&signal_id)
                .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
            if track.def.data_type != DataType::F32 {
                return Err(SiglogError::ParameterInvalid(format!(
                    "signal {signal_id} is not an F32 signal"
                )));
            }
        }
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.fsr(signal_id, sample_id, &bytes, samples.len())
    }

    /// Attach an annotation to a signal. `timestamp` is a sample id for FSR
    /// signals and a UTC time for VSR signals (including signal 0);
    /// timestamps must be non-decreasing per signal.
    #[allow(clippy::too_many_arguments)]
    pub fn annotation(
        &mut self,
        signal_id: u16,
        timestamp: i64,
        y: f32,
        annotation_type: AnnotationType,
        group_id: u8,
        storage_type: StorageType,
        payload: &[u8],
    ) -> SiglogResult<()> {
        self.check_open()?;
        let track = self
            .tracks
            .get_mut(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        track.write_annotation(
            &mut self.chunks,
            Annotation {
                timestamp,
                y,
                annotation_type,
                group_id,
                storage_type,
                payload: payload.to_vec(),
            },
        )
    }

    /// Record that `sample_id` was acquired at UTC `timestamp`. Sample ids
    /// must be strictly increasing per signal.
    pub fn utc(&mut self, signal_id: u16, sample_id: i64, timestamp: i64) -> SiglogResult<()> {
        self.check_open()?;
        let track = self
            .tracks
            .get_mut(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        track.write_utc(&mut self.chunks, sample_id, timestamp)
    }

    /// Suppress (or re-enable) level-0 data chunks for a signal; summaries
    /// are still maintained. Raw reads of such a signal fail with
    /// `Unsupported`.
    pub fn fsr_omit_data(&mut self, signal_id: u16, omit: bool) -> SiglogResult<()> {
        self.check_open()?;
        let track = self
            .tracks
            .get_mut(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        track.omit_data = omit;
        Ok(())
    }

    /// Flush the underlying [writer](Write). Partial level buffers stay in
    /// memory; they only land on disk when full or at [`finish`](Self::finish).
    pub fn flush(&mut self) -> SiglogResult<()> {
        self.check_open()?;
        self.chunks.flush()
    }

    /// Flush every track bottom-up, write the end-of-file index and patch
    /// the file header to point at it. Idempotent.
    pub fn finish(&mut self) -> SiglogResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut signal_lengths = Vec::new();
        for (id, track) in self.tracks.iter_mut() {
            track.finish(&mut self.chunks)?;
            if track.sample_count() > 0 {
                signal_lengths.push(SignalLength {
                    signal_id: *id,
                    sample_count: track.sample_count(),
                });
            }
        }
        let end = EndPayload {
            chains: self.chunks.chain_heads(),
            signal_lengths,
        };
        let offset = self.chunks.write_chunk(tag::END, 0, &records::to_vec(&end)?)?;
        self.chunks.patch_root_index(offset)?;
        self.chunks.flush()
    }
}

impl<W: Write + Seek> Drop for Writer<W> {
    fn drop(&mut self) {
        self.finish().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn writer() -> Writer<Cursor<Vec<u8>>> {
        Writer::new(Cursor::new(Vec::new())).unwrap()
    }

    #[test]
    fn duplicate_source_rejected() {
        let mut w = writer();
        w.source_def(&SourceDef::new(3, "dev")).unwrap();
        let err = w.source_def(&SourceDef::new(3, "dev")).unwrap_err();
        assert!(matches!(err, SiglogError::AlreadyExists(_)));
        // state is intact: a different id still works
        w.source_def(&SourceDef::new(4, "dev2")).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn source_zero_reserved() {
        let mut w = writer();
        assert!(matches!(
            w.source_def(&SourceDef::new(0, "nope")),
            Err(SiglogError::ParameterInvalid(_))
        ));
        w.finish().unwrap();
    }

    #[test]
    fn signal_requires_source() {
        let mut w = writer();
        let def = SignalDef::new(1, 7, SignalKind::Fsr, DataType::F32, 1000, "s");
        assert!(matches!(w.signal_def(&def), Err(SiglogError::NotFound(_))));
        w.finish().unwrap();
    }

    #[test]
    fn duplicate_signal_rejected() {
        let mut w = writer();
        w.source_def(&SourceDef::new(1, "dev")).unwrap();
        let def = SignalDef::new(1, 1, SignalKind::Fsr, DataType::F32, 1000, "s");
        w.signal_def(&def).unwrap();
        assert!(matches!(
            w.signal_def(&def),
            Err(SiglogError::AlreadyExists(_))
        ));
        w.finish().unwrap();
    }

    #[test]
    fn fsr_validates_length_and_kind() {
        let mut w = writer();
        w.source_def(&SourceDef::new(1, "dev")).unwrap();
        w.signal_def(&SignalDef::new(1, 1, SignalKind::Fsr, DataType::F32, 1000, "s"))
            .unwrap();
        // 3 bytes cannot hold 1 f32 sample
        assert!(matches!(
            w.fsr(1, 0, &[0, 0, 0], 1),
            Err(SiglogError::ParameterInvalid(_))
        ));
        assert!(matches!(w.fsr(9, 0, &[0; 4], 1), Err(SiglogError::NotFound(_))));
        // annotations on the implicit global signal work without a def
        w.annotation(0, 0, f32::NAN, AnnotationType::Text, 0, StorageType::String, b"hi")
            .unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn finish_is_idempotent() {
        let mut w = writer();
        w.finish().unwrap();
        w.finish().unwrap();
        assert!(matches!(w.flush(), Err(SiglogError::Abort(_))));
    }
}
