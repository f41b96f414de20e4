//! Read SigLog files.
//!
//! [`Reader`] builds its chunk index from the end record the file header
//! points at. When that record is missing or damaged (a recording that was
//! never closed), it falls back to a forward scan that tolerates torn
//! chunks, reconstructing the per-signal indexes from the data and summary
//! chunks themselves.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::chunk::{
    self, read_chunk_at, read_header_at, ChainIter, ChunkHeader, FileHeader, FILE_HEADER_SIZE,
};
use crate::data_type::{BaseType, DataType};
use crate::records::{
    self, meta_level, meta_signal, tag, Annotation, AnnotationPayload, DataPayload, EndPayload,
    IndexEntry, IndexPayload, SignalDef, SignalKind, SkipRange, SourceDef, StorageType,
    SummaryEntry, SummaryPayload, UtcEntry, UtcPayload,
};
use crate::stats::SummaryAccum;
use crate::{time, SiglogError, SiglogResult, FORMAT_VERSION};

struct LoadedData {
    offset: u64,
    payload: DataPayload,
}

struct LoadedSummary {
    offset: u64,
    /// Global entry index of `entries[0]` at this level.
    first_entry: i64,
    entries: Vec<SummaryEntry>,
}

struct SignalState {
    def: SignalDef,
    /// Timeline length in samples, skip fill included (relative ids).
    sample_count: i64,
    /// Level-1 derived length estimate used when data chunks are absent.
    summary_count_estimate: i64,
    omit_data: bool,
    data_index: Vec<IndexEntry>,
    /// `summary_index[0]` indexes level 1.
    summary_index: Vec<Vec<IndexEntry>>,
    utc_index: Vec<IndexEntry>,
    ann_index: Vec<IndexEntry>,
    tmap: Option<Vec<UtcEntry>>,
    data_cache: Option<LoadedData>,
    summary_cache: Vec<Option<LoadedSummary>>,
}

impl SignalState {
    fn new(def: SignalDef) -> SignalState {
        SignalState {
            def,
            sample_count: 0,
            summary_count_estimate: 0,
            omit_data: false,
            data_index: Vec::new(),
            summary_index: Vec::new(),
            utc_index: Vec::new(),
            ann_index: Vec::new(),
            tmap: None,
            data_cache: None,
            summary_cache: Vec::new(),
        }
    }

    fn level_index_mut(&mut self, level: u8) -> &mut Vec<IndexEntry> {
        let li = (level - 1) as usize;
        if self.summary_index.len() <= li {
            self.summary_index.resize_with(li + 1, Vec::new);
        }
        &mut self.summary_index[li]
    }
}

fn is_skipped(skips: &[SkipRange], index: u32) -> bool {
    let pos = skips.partition_point(|s| s.start <= index);
    match pos {
        0 => false,
        p => {
            let s = skips[p - 1];
            index < s.start + s.length
        }
    }
}

/// Reads a SigLog file from any [`Read`] + [`Seek`] source.
///
/// All operations take `&mut self`: the reader owns its handle and is meant
/// to be driven from a single thread.
pub struct Reader<R: Read + Seek> {
    r: R,
    header: FileHeader,
    sources: BTreeMap<u16, SourceDef>,
    signals: BTreeMap<u16, SignalState>,
    user_data_head: u64,
}

impl Reader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> SiglogResult<Self> {
        Reader::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> Reader<R> {
    pub fn new(mut r: R) -> SiglogResult<Self> {
        let header = chunk::read_file_header(&mut r)?;
        if header.version != FORMAT_VERSION {
            return Err(SiglogError::UnsupportedVersion(header.version));
        }
        let mut reader = Reader {
            r,
            header,
            sources: BTreeMap::new(),
            signals: BTreeMap::new(),
            user_data_head: 0,
        };
        reader.reset_tables();
        let loaded = if header.root_index_offset != 0 {
            match reader.load_from_end(header.root_index_offset) {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("root index unreadable ({err}); falling back to a full scan");
                    reader.reset_tables();
                    false
                }
            }
        } else {
            false
        };
        if !loaded {
            reader.scan()?;
        }
        for state in reader.signals.values_mut() {
            if state.sample_count == 0 && state.data_index.is_empty() {
                state.sample_count = state.summary_count_estimate;
            }
            state.omit_data = state.sample_count > 0 && state.data_index.is_empty();
        }
        Ok(reader)
    }

    fn reset_tables(&mut self) {
        self.sources.clear();
        self.signals.clear();
        self.user_data_head = 0;
        // implicit id-0 defaults
        self.sources.insert(0, SourceDef::global());
        self.signals.insert(0, SignalState::new(SignalDef::global()));
    }

    fn load_from_end(&mut self, offset: u64) -> SiglogResult<()> {
        let (header, payload) = read_chunk_at(&mut self.r, offset)?;
        if header.tag != tag::END {
            return Err(SiglogError::Parse(
                "root index does not point at an end chunk".into(),
            ));
        }
        let end: EndPayload = records::from_slice(&payload)?;

        // definition chains first so the signal states exist
        for chain in &end.chains {
            match chain.tag {
                tag::SOURCE_DEF => {
                    for item in ChainIter::new(&mut self.r, chain.head) {
                        let (_, _, payload) = item?;
                        let def: SourceDef = records::from_slice(&payload)?;
                        self.sources.insert(def.source_id, def);
                    }
                }
                tag::SIGNAL_DEF => {
                    for item in ChainIter::new(&mut self.r, chain.head) {
                        let (_, _, payload) = item?;
                        let def: SignalDef = records::from_slice(&payload)?;
                        self.signals.insert(def.signal_id, SignalState::new(def));
                    }
                }
                _ => {}
            }
        }
        for chain in &end.chains {
            let signal_id = chain.signal_id as u16;
            match chain.tag {
                tag::INDEX => {
                    let entries = Self::read_index_chain(&mut self.r, chain.head)?;
                    if let Some(state) = self.signals.get_mut(&signal_id) {
                        if chain.level == 0 {
                            state.data_index = entries;
                        } else {
                            *state.level_index_mut(chain.level as u8) = entries;
                        }
                    }
                }
                tag::UTC_INDEX => {
                    let entries = Self::read_index_chain(&mut self.r, chain.head)?;
                    if let Some(state) = self.signals.get_mut(&signal_id) {
                        state.utc_index = entries;
                    }
                }
                tag::ANNOTATION_INDEX => {
                    let entries = Self::read_index_chain(&mut self.r, chain.head)?;
                    if let Some(state) = self.signals.get_mut(&signal_id) {
                        state.ann_index = entries;
                    }
                }
                tag::USER_DATA => self.user_data_head = chain.head,
                _ => {}
            }
        }
        for length in &end.signal_lengths {
            if let Some(state) = self.signals.get_mut(&length.signal_id) {
                state.sample_count = length.sample_count;
            }
        }
        Ok(())
    }

    fn read_index_chain(r: &mut R, head: u64) -> SiglogResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for item in ChainIter::new(r, head) {
            let (_, _, payload) = item?;
            let parsed: IndexPayload = records::from_slice(&payload)?;
            entries.extend(parsed.entries);
        }
        Ok(entries)
    }

    /// Forward scan honoring the per-tag back pointers: walk headers from
    /// the front, skipping 8 bytes at a time past anything unreadable.
    fn scan(&mut self) -> SiglogResult<()> {
        log::warn!("no usable root index; scanning the file");
        let file_len = self.r.seek(SeekFrom::End(0))?;
        let mut pos = FILE_HEADER_SIZE;
        let mut found = false;
        while pos + chunk::PAYLOAD_PREFIX_SIZE <= file_len {
            match read_header_at(&mut self.r, pos) {
                Ok(header) => {
                    match read_chunk_at(&mut self.r, pos) {
                        Ok((_, payload)) => {
                            found = true;
                            self.scan_chunk(pos, &header, &payload);
                        }
                        Err(err) => log::warn!("skipping chunk at {pos}: {err}"),
                    }
                    pos += header.total_size();
                }
                Err(_) => pos += 8,
            }
        }
        if !found {
            return Err(SiglogError::Truncated);
        }
        Ok(())
    }

    fn scan_chunk(&mut self, offset: u64, header: &ChunkHeader, payload: &[u8]) {
        let signal_id = meta_signal(header.chunk_meta);
        match header.tag {
            tag::SOURCE_DEF => match records::from_slice::<SourceDef>(payload) {
                Ok(def) => {
                    self.sources.insert(def.source_id, def);
                }
                Err(err) => log::warn!("bad source def at {offset}: {err}"),
            },
            tag::SIGNAL_DEF => match records::from_slice::<SignalDef>(payload) {
                Ok(def) => {
                    self.signals.insert(def.signal_id, SignalState::new(def));
                }
                Err(err) => log::warn!("bad signal def at {offset}: {err}"),
            },
            tag::USER_DATA => {
                if self.user_data_head == 0 {
                    self.user_data_head = offset;
                }
            }
            tag::DATA => match records::from_slice::<DataPayload>(payload) {
                Ok(data) => {
                    if let Some(state) = self.signals.get_mut(&signal_id) {
                        state.data_index.push(IndexEntry {
                            offset,
                            first_sample_id: data.first_sample_id,
                        });
                        state.sample_count = state
                            .sample_count
                            .max(data.first_sample_id + data.sample_count as i64);
                    }
                }
                Err(err) => log::warn!("bad data chunk at {offset}: {err}"),
            },
            tag::SUMMARY => match records::from_slice::<SummaryPayload>(payload) {
                Ok(summary) => {
                    let level = meta_level(header.chunk_meta);
                    if let Some(state) = self.signals.get_mut(&signal_id) {
                        state.level_index_mut(level).push(IndexEntry {
                            offset,
                            first_sample_id: summary.first_sample_id,
                        });
                        if level == 1 {
                            let span = state.def.level_span(1) as i64;
                            state.summary_count_estimate = state.summary_count_estimate.max(
                                summary.first_sample_id + summary.entries.len() as i64 * span,
                            );
                        }
                    }
                }
                Err(err) => log::warn!("bad summary chunk at {offset}: {err}"),
            },
            tag::UTC => match records::from_slice::<UtcPayload>(payload) {
                Ok(utc) => {
                    if let (Some(state), Some(first)) =
                        (self.signals.get_mut(&signal_id), utc.entries.first())
                    {
                        state.utc_index.push(IndexEntry {
                            offset,
                            first_sample_id: first.sample_id,
                        });
                    }
                }
                Err(err) => log::warn!("bad utc chunk at {offset}: {err}"),
            },
            tag::ANNOTATION => match records::from_slice::<AnnotationPayload>(payload) {
                Ok(ann) => {
                    if let (Some(state), Some(first)) =
                        (self.signals.get_mut(&signal_id), ann.entries.first())
                    {
                        state.ann_index.push(IndexEntry {
                            offset,
                            first_sample_id: first.timestamp,
                        });
                    }
                }
                Err(err) => log::warn!("bad annotation chunk at {offset}: {err}"),
            },
            // index chunks are rebuilt from the chunks themselves
            tag::INDEX | tag::UTC_INDEX | tag::ANNOTATION_INDEX | tag::END => {}
            other => log::debug!("ignoring unknown chunk tag {other:#04x} at {offset}"),
        }
    }

    /// The parsed file header.
    pub fn creation_time(&self) -> i64 {
        self.header.creation_time
    }

    /// All sources, the implicit id-0 "global" source included.
    pub fn sources(&self) -> Vec<SourceDef> {
        self.sources.values().cloned().collect()
    }

    /// All signals, the implicit id-0 annotation signal included.
    pub fn signals(&self) -> Vec<SignalDef> {
        self.signals.values().map(|s| s.def.clone()).collect()
    }

    pub fn signal(&self, signal_id: u16) -> Option<&SignalDef> {
        self.signals.get(&signal_id).map(|s| &s.def)
    }

    /// Timeline length of a signal in samples, skip fill included.
    pub fn signal_length(&self, signal_id: u16) -> SiglogResult<i64> {
        self.signals
            .get(&signal_id)
            .map(|s| s.sample_count)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))
    }

    /// False when the signal was recorded with `fsr_omit_data`.
    pub fn data_stored(&self, signal_id: u16) -> SiglogResult<bool> {
        self.signals
            .get(&signal_id)
            .map(|s| !s.omit_data)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))
    }

    fn validate_range(
        &self,
        signal_id: u16,
        start: i64,
        samples: i64,
    ) -> SiglogResult<(i64, DataType, bool)> {
        let state = self
            .signals
            .get(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        if state.def.kind != SignalKind::Fsr {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal {signal_id} is not an FSR signal"
            )));
        }
        let offset = state.def.sample_id_offset;
        if start < offset || start - offset + samples > state.sample_count {
            return Err(SiglogError::ParameterInvalid(format!(
                "range [{start}, {}) outside [{offset}, {})",
                start + samples,
                offset + state.sample_count
            )));
        }
        Ok((start - offset, state.def.data_type, state.omit_data))
    }

    fn state_mut(
        signals: &mut BTreeMap<u16, SignalState>,
        signal_id: u16,
    ) -> SiglogResult<&mut SignalState> {
        signals
            .get_mut(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))
    }

    fn load_data<'s>(
        r: &mut R,
        state: &'s mut SignalState,
        index_pos: usize,
    ) -> SiglogResult<&'s DataPayload> {
        let offset = state.data_index[index_pos].offset;
        let hit = matches!(&state.data_cache, Some(c) if c.offset == offset);
        if !hit {
            let (header, payload) = read_chunk_at(r, offset)?;
            if header.tag != tag::DATA {
                return Err(SiglogError::Parse(format!(
                    "expected a data chunk at {offset}"
                )));
            }
            let parsed: DataPayload = records::from_slice(&payload)?;
            state.data_cache = Some(LoadedData {
                offset,
                payload: parsed,
            });
        }
        match &state.data_cache {
            Some(c) => Ok(&c.payload),
            None => unreachable!("populated above"),
        }
    }

    fn load_summary<'s>(
        r: &mut R,
        state: &'s mut SignalState,
        li: usize,
        index_pos: usize,
    ) -> SiglogResult<&'s LoadedSummary> {
        if state.summary_cache.len() < state.summary_index.len() {
            let len = state.summary_index.len();
            state.summary_cache.resize_with(len, || None);
        }
        let offset = state.summary_index[li][index_pos].offset;
        let span = state.def.level_span((li + 1) as u8) as i64;
        let hit = matches!(&state.summary_cache[li], Some(c) if c.offset == offset);
        if !hit {
            let (header, payload) = read_chunk_at(r, offset)?;
            if header.tag != tag::SUMMARY {
                return Err(SiglogError::Parse(format!(
                    "expected a summary chunk at {offset}"
                )));
            }
            let parsed: SummaryPayload = records::from_slice(&payload)?;
            state.summary_cache[li] = Some(LoadedSummary {
                offset,
                first_entry: parsed.first_sample_id / span,
                entries: parsed.entries,
            });
        }
        match &state.summary_cache[li] {
            Some(c) => Ok(c),
            None => unreachable!("populated above"),
        }
    }

    /// Read the samples of `[start, start + length)` promoted to f64.
    /// Skip-filled samples read as NaN (floats) or zero (integers).
    pub fn fsr(&mut self, signal_id: u16, start: i64, length: usize) -> SiglogResult<Vec<f64>> {
        let (rel_start, dt, omit) = self.validate_range(signal_id, start, length as i64)?;
        if omit {
            return Err(SiglogError::Unsupported(format!(
                "data not stored for signal {signal_id}"
            )));
        }
        let fill = if dt.base == BaseType::Float { f64::NAN } else { 0.0 };
        let mut out = vec![fill; length];
        let Self { r, signals, .. } = self;
        let state = Self::state_mut(signals, signal_id)?;
        let rel_end = rel_start + length as i64;
        let mut pos = match state
            .data_index
            .partition_point(|e| e.first_sample_id <= rel_start)
        {
            0 => 0,
            p => p - 1,
        };
        while pos < state.data_index.len() && state.data_index[pos].first_sample_id < rel_end {
            let payload = Self::load_data(r, state, pos)?;
            let first = payload.first_sample_id;
            let lo = rel_start.max(first);
            let hi = rel_end.min(first + payload.sample_count as i64);
            for i in lo..hi {
                out[(i - rel_start) as usize] = dt.read_sample(&payload.data, (i - first) as usize);
            }
            pos += 1;
        }
        Ok(out)
    }

    /// Read `[start, start + length)` as packed little-endian samples,
    /// re-aligned to bit 0 of the returned buffer.
    pub fn fsr_raw(&mut self, signal_id: u16, start: i64, length: usize) -> SiglogResult<Vec<u8>> {
        let (rel_start, dt, omit) = self.validate_range(signal_id, start, length as i64)?;
        if omit {
            return Err(SiglogError::Unsupported(format!(
                "data not stored for signal {signal_id}"
            )));
        }
        let bit_width = dt.bit_width as usize;
        let mut out = vec![0u8; dt.bytes_for(length)];
        let Self { r, signals, .. } = self;
        let state = Self::state_mut(signals, signal_id)?;
        let rel_end = rel_start + length as i64;
        let mut pos = match state
            .data_index
            .partition_point(|e| e.first_sample_id <= rel_start)
        {
            0 => 0,
            p => p - 1,
        };
        while pos < state.data_index.len() && state.data_index[pos].first_sample_id < rel_end {
            let payload = Self::load_data(r, state, pos)?;
            let first = payload.first_sample_id;
            let lo = rel_start.max(first);
            let hi = rel_end.min(first + payload.sample_count as i64);
            if hi > lo {
                crate::data_type::copy_bits(
                    &mut out,
                    (lo - rel_start) as usize * bit_width,
                    &payload.data,
                    (lo - first) as usize * bit_width,
                    (hi - lo) as usize * bit_width,
                );
            }
            pos += 1;
        }
        Ok(out)
    }

    /// Compute `(mean, std, min, max)` for `length` consecutive windows of
    /// `increment` samples starting at `start`.
    ///
    /// Windows narrower than one level-1 summary entry are computed exactly
    /// from raw samples; wider windows recompute their raw edges exactly and
    /// merge whole summary entries from the highest feasible level for the
    /// middle.
    pub fn fsr_statistics(
        &mut self,
        signal_id: u16,
        start: i64,
        increment: i64,
        length: usize,
    ) -> SiglogResult<Vec<[f64; 4]>> {
        if increment < 1 || length == 0 {
            return Err(SiglogError::ParameterInvalid(
                "increment and length must be positive".into(),
            ));
        }
        let total = increment
            .checked_mul(length as i64)
            .ok_or_else(|| SiglogError::ParameterInvalid("statistics range overflows".into()))?;
        let (rel_start, _, omit) = self.validate_range(signal_id, start, total)?;
        let Self { r, signals, .. } = self;
        let state = Self::state_mut(signals, signal_id)?;
        let sdf = state.def.sample_decimate_factor as i64;

        let mut rows = Vec::with_capacity(length);
        for w in 0..length {
            let a = rel_start + w as i64 * increment;
            let b = a + increment;
            let acc = if omit {
                Self::window_stats_summary_only(r, state, a, b)?
            } else if length == 1 || increment < sdf {
                // a single window has no internal boundary: always exact
                let mut acc = SummaryAccum::new();
                Self::raw_stats(r, state, a, b, &mut acc)?;
                acc
            } else {
                Self::window_stats(r, state, a, b)?
            };
            rows.push([acc.mean(), acc.std(), acc.min(), acc.max()]);
        }
        Ok(rows)
    }

    /// Exact statistics over raw samples in `[a, b)` (relative ids).
    fn raw_stats(
        r: &mut R,
        state: &mut SignalState,
        a: i64,
        b: i64,
        acc: &mut SummaryAccum,
    ) -> SiglogResult<()> {
        if b <= a {
            return Ok(());
        }
        let dt = state.def.data_type;
        let mut pos = match state.data_index.partition_point(|e| e.first_sample_id <= a) {
            0 => 0,
            p => p - 1,
        };
        while pos < state.data_index.len() && state.data_index[pos].first_sample_id < b {
            let payload = Self::load_data(r, state, pos)?;
            let first = payload.first_sample_id;
            let lo = a.max(first);
            let hi = b.min(first + payload.sample_count as i64);
            for i in lo..hi {
                let ci = (i - first) as usize;
                if is_skipped(&payload.skips, ci as u32) {
                    continue;
                }
                acc.add(dt.read_sample(&payload.data, ci));
            }
            pos += 1;
        }
        Ok(())
    }

    /// One window: raw head, summary middle at the highest feasible level,
    /// raw tail.
    fn window_stats(r: &mut R, state: &mut SignalState, a: i64, b: i64) -> SiglogResult<SummaryAccum> {
        let sdf = state.def.sample_decimate_factor as i64;
        let mut acc = SummaryAccum::new();
        let a_aligned = (a + sdf - 1) / sdf * sdf;
        let b_aligned = b / sdf * sdf;
        if b_aligned <= a_aligned {
            Self::raw_stats(r, state, a, b, &mut acc)?;
        } else {
            Self::raw_stats(r, state, a, a_aligned, &mut acc)?;
            let top = Self::feasible_level(state, b_aligned - a_aligned);
            Self::level_stats(r, state, top, a_aligned, b_aligned, &mut acc)?;
            Self::raw_stats(r, state, b_aligned, b, &mut acc)?;
        }
        Ok(acc)
    }

    /// The highest summary level whose entry span fits in `range` samples.
    fn feasible_level(state: &SignalState, range: i64) -> u8 {
        let mut level = 1u8;
        while (level as usize) < state.summary_index.len()
            && state.def.level_span(level + 1) as i64 <= range
        {
            level += 1;
        }
        level
    }

    /// Statistics over `[a, b)` using whole entries at `level` for the
    /// aligned middle and recursing one level down on the edges. `a` and `b`
    /// are multiples of the level-1 span.
    fn level_stats(
        r: &mut R,
        state: &mut SignalState,
        level: u8,
        a: i64,
        b: i64,
        acc: &mut SummaryAccum,
    ) -> SiglogResult<()> {
        if b <= a {
            return Ok(());
        }
        let span = state.def.level_span(level) as i64;
        if level == 1 {
            return Self::entries_stats(r, state, 1, a / span, b / span, acc);
        }
        let a_aligned = (a + span - 1) / span * span;
        let b_aligned = b / span * span;
        if b_aligned <= a_aligned {
            return Self::level_stats(r, state, level - 1, a, b, acc);
        }
        Self::level_stats(r, state, level - 1, a, a_aligned, acc)?;
        Self::entries_stats(r, state, level, a_aligned / span, b_aligned / span, acc)?;
        Self::level_stats(r, state, level - 1, b_aligned, b, acc)
    }

    /// Merge entries `e0..e1` of `level`. A missing entry (recording that
    /// was never closed) falls back to exact raw recomputation.
    fn entries_stats(
        r: &mut R,
        state: &mut SignalState,
        level: u8,
        e0: i64,
        e1: i64,
        acc: &mut SummaryAccum,
    ) -> SiglogResult<()> {
        let span = state.def.level_span(level) as i64;
        let total = state.sample_count;
        for e in e0..e1 {
            match Self::summary_entry(r, state, level, e)? {
                Some(entry) => {
                    let count = (total - e * span).min(span).max(0) as u64;
                    acc.merge(&SummaryAccum::from_entry(&entry, count));
                }
                None if !state.omit_data => {
                    let lo = e * span;
                    let hi = ((e + 1) * span).min(total);
                    Self::raw_stats(r, state, lo, hi, acc)?;
                }
                None => log::warn!(
                    "signal {}: no summary or data covering entry {e} at level {level}",
                    state.def.signal_id
                ),
            }
        }
        Ok(())
    }

    fn summary_entry(
        r: &mut R,
        state: &mut SignalState,
        level: u8,
        e: i64,
    ) -> SiglogResult<Option<SummaryEntry>> {
        let li = (level - 1) as usize;
        if li >= state.summary_index.len() || state.summary_index[li].is_empty() {
            return Ok(None);
        }
        let span = state.def.level_span(level) as i64;
        let pos = match state.summary_index[li].partition_point(|ie| ie.first_sample_id / span <= e)
        {
            0 => return Ok(None),
            p => p - 1,
        };
        let loaded = Self::load_summary(r, state, li, pos)?;
        let local = e - loaded.first_entry;
        if local < 0 || local as usize >= loaded.entries.len() {
            return Ok(None);
        }
        Ok(Some(loaded.entries[local as usize]))
    }

    /// Statistics from summaries alone (signals recorded with
    /// `fsr_omit_data`): boundary entries are weighted by their overlap
    /// fraction, so edges are approximate.
    fn window_stats_summary_only(
        r: &mut R,
        state: &mut SignalState,
        a: i64,
        b: i64,
    ) -> SiglogResult<SummaryAccum> {
        let span = state.def.level_span(1) as i64;
        let total = state.sample_count;
        let mut acc = SummaryAccum::new();
        let e0 = a / span;
        let e1 = (b + span - 1) / span;
        for e in e0..e1 {
            if let Some(entry) = Self::summary_entry(r, state, 1, e)? {
                let full = (total - e * span).min(span).max(0);
                let lo = a.max(e * span);
                let hi = b.min((e + 1) * span);
                let count = ((full as f64) * (hi - lo) as f64 / span as f64).round() as u64;
                acc.merge(&SummaryAccum::from_entry(&entry, count.max(1)));
            }
        }
        Ok(acc)
    }

    /// Stream annotations of a signal with `timestamp >= from_timestamp`.
    /// The callback returns false to stop.
    pub fn annotations<F: FnMut(&Annotation) -> bool>(
        &mut self,
        signal_id: u16,
        from_timestamp: i64,
        mut f: F,
    ) -> SiglogResult<()> {
        let Self { r, signals, .. } = self;
        let state = signals
            .get(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        let start = match state
            .ann_index
            .partition_point(|e| e.first_sample_id <= from_timestamp)
        {
            0 => 0,
            p => p - 1,
        };
        for ie in &state.ann_index[start..] {
            let (header, payload) = read_chunk_at(r, ie.offset)?;
            if header.tag != tag::ANNOTATION {
                return Err(SiglogError::Parse(format!(
                    "expected an annotation chunk at {}",
                    ie.offset
                )));
            }
            let parsed: AnnotationPayload = records::from_slice(&payload)?;
            for entry in &parsed.entries {
                if entry.timestamp < from_timestamp {
                    continue;
                }
                if !f(entry) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Stream user-data records in write order. The callback receives the
    /// caller's opaque meta value and returns false to stop.
    pub fn user_data<F: FnMut(u16, StorageType, &[u8]) -> bool>(
        &mut self,
        mut f: F,
    ) -> SiglogResult<()> {
        if self.user_data_head == 0 {
            return Ok(());
        }
        let head = self.user_data_head;
        for item in ChainIter::new(&mut self.r, head) {
            let (_, header, payload) = item?;
            let parsed: records::UserDataPayload = records::from_slice(&payload)?;
            if !f(header.chunk_meta, parsed.storage_type, &parsed.payload) {
                break;
            }
        }
        Ok(())
    }

    /// Stream UTC entries of a signal with `sample_id >= from_sample_id`.
    pub fn utc<F: FnMut(&UtcEntry) -> bool>(
        &mut self,
        signal_id: u16,
        from_sample_id: i64,
        mut f: F,
    ) -> SiglogResult<()> {
        let Self { r, signals, .. } = self;
        let state = signals
            .get(&signal_id)
            .ok_or_else(|| SiglogError::NotFound(format!("signal {signal_id}")))?;
        let start = match state
            .utc_index
            .partition_point(|e| e.first_sample_id <= from_sample_id)
        {
            0 => 0,
            p => p - 1,
        };
        for ie in &state.utc_index[start..] {
            let (header, payload) = read_chunk_at(r, ie.offset)?;
            if header.tag != tag::UTC {
                return Err(SiglogError::Parse(format!(
                    "expected a utc chunk at {}",
                    ie.offset
                )));
            }
            let parsed: UtcPayload = records::from_slice(&payload)?;
            for entry in &parsed.entries {
                if entry.sample_id < from_sample_id {
                    continue;
                }
                if !f(entry) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn tmap_entries(&mut self, signal_id: u16) -> SiglogResult<&[UtcEntry]> {
        let Self { r, signals, .. } = self;
        let state = Self::state_mut(signals, signal_id)?;
        if state.tmap.is_none() {
            let mut entries = Vec::new();
            for ie in &state.utc_index {
                let (_, payload) = read_chunk_at(r, ie.offset)?;
                let parsed: UtcPayload = records::from_slice(&payload)?;
                entries.extend(parsed.entries);
            }
            state.tmap = Some(entries);
        }
        match &state.tmap {
            Some(entries) => Ok(entries),
            None => unreachable!("populated above"),
        }
    }

    /// Number of (sample_id, utc) pairs recorded for a signal.
    pub fn tmap_length(&mut self, signal_id: u16) -> SiglogResult<usize> {
        Ok(self.tmap_entries(signal_id)?.len())
    }

    pub fn tmap_get(&mut self, signal_id: u16, index: usize) -> SiglogResult<UtcEntry> {
        self.tmap_entries(signal_id)?
            .get(index)
            .copied()
            .ok_or_else(|| SiglogError::ParameterInvalid(format!("tmap index {index} out of range")))
    }

    /// Map a sample id to UTC by piecewise-linear interpolation over the
    /// tmap, extrapolating past the ends.
    pub fn sample_id_to_timestamp(&mut self, signal_id: u16, sample_id: i64) -> SiglogResult<i64> {
        let sample_rate = self
            .signal(signal_id)
            .map(|def| def.sample_rate)
            .unwrap_or(0);
        let entries = self.tmap_entries(signal_id)?;
        if entries.is_empty() {
            return Err(SiglogError::NotFound(format!(
                "signal {signal_id} has no utc entries"
            )));
        }
        Ok(interpolate_sid_to_ts(entries, sample_rate, sample_id))
    }

    /// Inverse of [`sample_id_to_timestamp`](Self::sample_id_to_timestamp).
    pub fn timestamp_to_sample_id(&mut self, signal_id: u16, timestamp: i64) -> SiglogResult<i64> {
        let sample_rate = self
            .signal(signal_id)
            .map(|def| def.sample_rate)
            .unwrap_or(0);
        let entries = self.tmap_entries(signal_id)?;
        if entries.is_empty() {
            return Err(SiglogError::NotFound(format!(
                "signal {signal_id} has no utc entries"
            )));
        }
        Ok(interpolate_ts_to_sid(entries, sample_rate, timestamp))
    }
}

/// 128-bit intermediates keep `(delta_sid * delta_utc)` from overflowing.
fn interpolate_sid_to_ts(entries: &[UtcEntry], sample_rate: u32, sample_id: i64) -> i64 {
    if entries.len() == 1 {
        let e = entries[0];
        if sample_rate == 0 {
            return e.timestamp;
        }
        let delta =
            (sample_id - e.sample_id) as i128 * time::SECOND as i128 / sample_rate as i128;
        return e.timestamp + delta as i64;
    }
    let pos = entries.partition_point(|e| e.sample_id <= sample_id);
    let (a, b) = bracket(entries, pos);
    let dsid = (b.sample_id - a.sample_id) as i128;
    if dsid == 0 {
        return a.timestamp;
    }
    let delta = (sample_id - a.sample_id) as i128 * (b.timestamp - a.timestamp) as i128 / dsid;
    a.timestamp + delta as i64
}

fn interpolate_ts_to_sid(entries: &[UtcEntry], sample_rate: u32, timestamp: i64) -> i64 {
    if entries.len() == 1 {
        let e = entries[0];
        if sample_rate == 0 {
            return e.sample_id;
        }
        let delta =
            (timestamp - e.timestamp) as i128 * sample_rate as i128 / time::SECOND as i128;
        return e.sample_id + delta as i64;
    }
    let pos = entries.partition_point(|e| e.timestamp <= timestamp);
    let (a, b) = bracket(entries, pos);
    let dts = (b.timestamp - a.timestamp) as i128;
    if dts == 0 {
        return a.sample_id;
    }
    let delta = (timestamp - a.timestamp) as i128 * (b.sample_id - a.sample_id) as i128 / dts;
    a.sample_id + delta as i64
}

fn bracket(entries: &[UtcEntry], pos: usize) -> (UtcEntry, UtcEntry) {
    if pos == 0 {
        (entries[0], entries[1])
    } else if pos >= entries.len() {
        (entries[entries.len() - 2], entries[entries.len() - 1])
    } else {
        (entries[pos - 1], entries[pos])
    }
}
