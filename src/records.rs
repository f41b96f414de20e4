//! Tag-specific chunk payloads.
//!
//! Every on-disk record is carried as the payload of a chunk (see
//! [`crate::chunk`] for the fixed header and chaining). Payloads are
//! little-endian; strings are NUL-terminated UTF-8.

use std::io::Cursor;

use binrw::*;

use crate::{data_type::DataType, SiglogError, SiglogResult};

/// Chunk tags.
///
/// Data, summary and index chunks exist per signal per level; annotation and
/// UTC chunks (and their one-level indexes) exist per signal; the remaining
/// tags form single file-wide chains.
pub mod tag {
    pub const SOURCE_DEF: u8 = 0x01;
    pub const SIGNAL_DEF: u8 = 0x02;
    pub const USER_DATA: u8 = 0x03;
    pub const DATA: u8 = 0x04;
    pub const SUMMARY: u8 = 0x05;
    pub const INDEX: u8 = 0x06;
    pub const ANNOTATION: u8 = 0x07;
    pub const ANNOTATION_INDEX: u8 = 0x08;
    pub const UTC: u8 = 0x09;
    pub const UTC_INDEX: u8 = 0x0a;
    pub const END: u8 = 0x0f;
}

/// `chunk_meta` for typed chunks: signal id in the low byte, level in the
/// high byte. User-data chunks use `chunk_meta` as a caller-opaque value.
pub fn chunk_meta(signal_id: u16, level: u8) -> u16 {
    (signal_id & 0x00ff) | (level as u16) << 8
}

pub fn meta_signal(chunk_meta: u16) -> u16 {
    chunk_meta & 0x00ff
}

pub fn meta_level(chunk_meta: u16) -> u8 {
    (chunk_meta >> 8) as u8
}

#[binrw::parser(reader, endian)]
fn parse_cstring() -> BinResult<String> {
    let pos = reader.stream_position()?;
    let mut bytes = Vec::new();
    loop {
        let b = u8::read_options(reader, endian, ())?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    String::from_utf8(bytes).map_err(|err| binrw::Error::Custom {
        pos,
        err: Box::new(err),
    })
}

/// Avoids an intermediate copy when serializing a NUL-terminated string.
#[binrw::writer(writer, endian)]
fn write_cstring(s: &String) -> BinResult<()> {
    s.as_bytes().write_options(writer, endian, ())?;
    0u8.write_options(writer, endian, ())?;
    Ok(())
}

/// Serialize a payload record to bytes.
pub(crate) fn to_vec<T: BinWrite<Args<'static> = ()>>(value: &T) -> SiglogResult<Vec<u8>> {
    let mut buf = Vec::new();
    value.write_options(&mut Cursor::new(&mut buf), Endian::Little, ())?;
    Ok(buf)
}

/// Parse a payload record from a chunk's payload bytes.
pub(crate) fn from_slice<T: BinRead<Args<'static> = ()>>(bytes: &[u8]) -> SiglogResult<T> {
    Ok(T::read_options(&mut Cursor::new(bytes), Endian::Little, ())?)
}

/// An instrument (or other producer) description. `source_id` 0 is the
/// implicit "global" source and cannot be defined explicitly.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
pub struct SourceDef {
    pub source_id: u16,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub name: String,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub vendor: String,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub model: String,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub version: String,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub serial_number: String,
}

impl SourceDef {
    pub fn new<S: Into<String>>(source_id: u16, name: S) -> SourceDef {
        SourceDef {
            source_id,
            name: name.into(),
            vendor: String::new(),
            model: String::new(),
            version: String::new(),
            serial_number: String::new(),
        }
    }

    /// The implicit source 0.
    pub fn global() -> SourceDef {
        SourceDef::new(0, "global")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum SignalKind {
    /// Fixed sample rate: sample ids increment by one per sample.
    Fsr = 0,
    /// Variable sample rate: each sample carries its own timestamp.
    Vsr = 1,
}

/// A signal definition. Structural parameters are final once defined; any
/// left at zero are auto-filled by [`resolve_defaults`](Self::resolve_defaults).
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
pub struct SignalDef {
    pub signal_id: u16,
    pub source_id: u16,
    pub kind: SignalKind,

    #[brw(pad_before = 1)]
    #[br(try_map = DataType::decode)]
    #[bw(map = |dt: &DataType| dt.encode())]
    pub data_type: DataType,

    /// Samples per second; 0 for VSR signals.
    pub sample_rate: u32,
    /// Level-0 data chunk capacity, in samples.
    pub samples_per_data: u32,
    /// Raw samples summarized by one level-1 entry.
    pub sample_decimate_factor: u32,
    /// Summary chunk capacity, in entries (all levels ≥ 1).
    pub entries_per_summary: u32,
    /// Level-k entries summarized by one level-k+1 entry.
    pub summary_decimate_factor: u32,
    /// Annotations per annotation chunk.
    pub annotation_decimate_factor: u32,
    /// UTC entries per UTC chunk.
    pub utc_decimate_factor: u32,
    /// Added to relative sample positions to form public sample ids.
    pub sample_id_offset: i64,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub name: String,

    #[br(parse_with = parse_cstring)]
    #[bw(write_with = write_cstring)]
    pub units: String,
}

impl SignalDef {
    /// A convenience constructor with all structural parameters zero
    /// (auto-filled at definition time).
    pub fn new<S: Into<String>>(
        signal_id: u16,
        source_id: u16,
        kind: SignalKind,
        data_type: DataType,
        sample_rate: u32,
        name: S,
    ) -> SignalDef {
        SignalDef {
            signal_id,
            source_id,
            kind,
            data_type,
            sample_rate,
            samples_per_data: 0,
            sample_decimate_factor: 0,
            entries_per_summary: 0,
            summary_decimate_factor: 0,
            annotation_decimate_factor: 0,
            utc_decimate_factor: 0,
            sample_id_offset: 0,
            name: name.into(),
            units: String::new(),
        }
    }

    /// The implicit signal 0: a VSR signal on source 0 that carries global
    /// annotations.
    pub fn global() -> SignalDef {
        SignalDef {
            signal_id: 0,
            source_id: 0,
            kind: SignalKind::Vsr,
            data_type: DataType::F32,
            sample_rate: 0,
            samples_per_data: 4096,
            sample_decimate_factor: 1024,
            entries_per_summary: 1024,
            summary_decimate_factor: 64,
            annotation_decimate_factor: 1024,
            utc_decimate_factor: 1024,
            sample_id_offset: 0,
            name: "global_annotation_signal".into(),
            units: String::new(),
        }
    }

    /// Fill zero-valued structural parameters and validate the result.
    ///
    /// Defaults: `sample_decimate_factor` is the power of two nearest the
    /// sample rate, clamped to `[16, 65536]` (1024 for VSR), which puts
    /// level-1 summaries near one entry per second and, with
    /// `summary_decimate_factor = 64`, level-2 near one entry per minute.
    /// `samples_per_data` defaults to four level-1 windows per data chunk.
    pub fn resolve_defaults(&mut self) -> SiglogResult<()> {
        match self.kind {
            SignalKind::Fsr if self.sample_rate == 0 => {
                return Err(SiglogError::ParameterInvalid(
                    "FSR signals require a non-zero sample rate".into(),
                ))
            }
            SignalKind::Vsr if self.sample_rate != 0 => {
                return Err(SiglogError::ParameterInvalid(
                    "VSR signals must use sample rate 0".into(),
                ))
            }
            _ => {}
        }
        if self.sample_decimate_factor == 0 {
            self.sample_decimate_factor = if self.sample_rate == 0 {
                1024
            } else {
                self.sample_rate.clamp(16, 65536).next_power_of_two().min(65536)
            };
        }
        if self.samples_per_data == 0 {
            self.samples_per_data = self.sample_decimate_factor.saturating_mul(4);
        }
        if self.summary_decimate_factor == 0 {
            self.summary_decimate_factor = 64;
        }
        if self.entries_per_summary == 0 {
            self.entries_per_summary = 1024;
        }
        if self.annotation_decimate_factor == 0 {
            self.annotation_decimate_factor = 1024;
        }
        if self.utc_decimate_factor == 0 {
            self.utc_decimate_factor = 1024;
        }

        if self.samples_per_data < self.sample_decimate_factor
            || self.samples_per_data % self.sample_decimate_factor != 0
        {
            return Err(SiglogError::ParameterInvalid(format!(
                "samples_per_data {} must be a multiple of sample_decimate_factor {}",
                self.samples_per_data, self.sample_decimate_factor
            )));
        }
        if self.entries_per_summary % self.summary_decimate_factor != 0 {
            return Err(SiglogError::ParameterInvalid(format!(
                "entries_per_summary {} must be a multiple of summary_decimate_factor {}",
                self.entries_per_summary, self.summary_decimate_factor
            )));
        }
        Ok(())
    }

    /// Timeline samples covered by one summary entry at `level` (1-based).
    pub fn level_span(&self, level: u8) -> u64 {
        let mut span = self.sample_decimate_factor as u64;
        for _ in 1..level {
            span = span.saturating_mul(self.summary_decimate_factor as u64);
        }
        span
    }
}

/// One summary window: population statistics over the valid samples it
/// covers. All four fields are NaN when the window had no valid samples.
#[derive(Debug, Clone, Copy, PartialEq, BinRead, BinWrite)]
pub struct SummaryEntry {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// A UTC anchor: this sample was acquired at this fixed-point UTC time
/// (see [`crate::time`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct UtcEntry {
    pub sample_id: i64,
    pub timestamp: i64,
}

/// One index entry: the chunk at `offset` starts at `first_sample_id`
/// (a timestamp for annotation indexes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct IndexEntry {
    pub offset: u64,
    pub first_sample_id: i64,
}

/// A run of skip-filled samples inside a data chunk, in chunk-relative
/// sample indices. Fill decodes as NaN for floats and bit-pattern zero for
/// integers; fills are excluded from summary statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct SkipRange {
    pub start: u32,
    pub length: u32,
}

/// Level-0 data chunk payload: packed samples plus skip metadata.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct DataPayload {
    pub first_sample_id: i64,
    pub sample_count: u32,

    #[br(temp)]
    #[bw(calc = skips.len() as u32)]
    skip_count: u32,

    #[br(count = skip_count)]
    pub skips: Vec<SkipRange>,

    #[br(temp)]
    #[bw(calc = data.len() as u32)]
    data_len: u32,

    #[br(count = data_len)]
    pub data: Vec<u8>,
}

/// Summary chunk payload (levels ≥ 1).
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPayload {
    /// Timeline sample id of the first entry's window.
    pub first_sample_id: i64,

    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,

    #[br(count = entry_count)]
    pub entries: Vec<SummaryEntry>,
}

/// Index chunk payload: one entry per flushed chunk of the indexed chain.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPayload {
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,

    #[br(count = entry_count)]
    pub entries: Vec<IndexEntry>,
}

/// UTC chunk payload.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct UtcPayload {
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,

    #[br(count = entry_count)]
    pub entries: Vec<UtcEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum AnnotationType {
    User = 0,
    Text = 1,
    Vmarker = 2,
    Hmarker = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(repr = u8)]
pub enum StorageType {
    Binary = 0,
    String = 1,
    Json = 2,
}

/// One annotation. `timestamp` is a sample id for FSR signals and a
/// fixed-point UTC time for VSR signals; `y` is the vertical position
/// (NaN = auto).
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub timestamp: i64,
    pub y: f32,
    pub annotation_type: AnnotationType,
    pub group_id: u8,

    #[brw(pad_after = 1)]
    pub storage_type: StorageType,

    #[br(temp)]
    #[bw(calc = payload.len() as u32)]
    payload_len: u32,

    #[br(count = payload_len)]
    pub payload: Vec<u8>,
}

/// Annotation chunk payload.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationPayload {
    #[br(temp)]
    #[bw(calc = entries.len() as u32)]
    entry_count: u32,

    #[br(count = entry_count)]
    pub entries: Vec<Annotation>,
}

/// User-data chunk payload. The chunk's `chunk_meta` is the caller's opaque
/// tag, so the storage type travels in the payload.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct UserDataPayload {
    #[brw(pad_after = 3)]
    pub storage_type: StorageType,

    #[br(temp)]
    #[bw(calc = payload.len() as u32)]
    payload_len: u32,

    #[br(count = payload_len)]
    pub payload: Vec<u8>,
}

/// Head and tail offsets of one doubly linked chunk chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct ChainHead {
    pub tag: u8,
    pub signal_id: u8,
    pub level: u16,
    pub head: u64,
    pub tail: u64,
}

/// Timeline length of one signal (including skip-filled regions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct SignalLength {
    pub signal_id: u16,
    #[brw(pad_before = 6)]
    pub sample_count: i64,
}

/// Payload of the end-of-file index chunk the file header points at.
#[binrw]
#[derive(Debug, Clone, PartialEq)]
pub struct EndPayload {
    #[br(temp)]
    #[bw(calc = chains.len() as u32)]
    chain_count: u32,

    #[br(count = chain_count)]
    pub chains: Vec<ChainHead>,

    #[br(temp)]
    #[bw(calc = signal_lengths.len() as u32)]
    length_count: u32,

    #[br(count = length_count)]
    pub signal_lengths: Vec<SignalLength>,
}
