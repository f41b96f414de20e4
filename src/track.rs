//! Per-signal track state.
//!
//! A track owns the level-0 packed sample buffer, the cascade of summary
//! levels above it, and the UTC/annotation sub-tracks. Level 1 summarizes
//! `sample_decimate_factor` raw samples per entry; each level above
//! summarizes `summary_decimate_factor` entries of the level below. Every
//! level buffers `entries_per_summary` entries per chunk and accumulates
//! index entries that are written as one index chunk per level at close.

use std::io::{Seek, Write};

use crate::chunk::ChunkWriter;
use crate::data_type;
use crate::records::{
    self, chunk_meta, tag, Annotation, AnnotationPayload, DataPayload, IndexEntry, IndexPayload,
    SignalDef, SkipRange, SummaryEntry, SummaryPayload, UtcEntry, UtcPayload,
};
use crate::stats::SummaryAccum;
use crate::{SiglogError, SiglogResult};

/// Cascade depth bound; with default geometry the top level spans more
/// samples than a recording can hold.
const MAX_LEVELS: usize = 16;

struct SummaryLevel {
    /// 1-based level number.
    level: u8,
    /// Timeline samples covered by one entry.
    span: u64,
    entries: Vec<SummaryEntry>,
    first_entry_index: i64,
    pending: SummaryAccum,
    pending_children: u32,
    index: Vec<IndexEntry>,
}

impl SummaryLevel {
    fn new(level: u8, def: &SignalDef) -> SummaryLevel {
        SummaryLevel {
            level,
            span: def.level_span(level),
            entries: Vec::new(),
            first_entry_index: 0,
            pending: SummaryAccum::new(),
            pending_children: 0,
            index: Vec::new(),
        }
    }
}

fn write_index<W: Write + Seek>(
    cw: &mut ChunkWriter<W>,
    chunk_tag: u8,
    meta: u16,
    entries: &[IndexEntry],
) -> SiglogResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let payload = IndexPayload {
        entries: entries.to_vec(),
    };
    cw.write_chunk(chunk_tag, meta, &records::to_vec(&payload)?)?;
    Ok(())
}

pub(crate) struct Track {
    pub(crate) def: SignalDef,
    pub(crate) omit_data: bool,
    /// Next expected relative sample id; also the timeline length.
    next_rel_id: i64,

    // level 0: packed samples
    buf: Vec<u8>,
    bit_len: usize,
    buf_first_id: i64,
    buf_count: u32,
    buf_skips: Vec<SkipRange>,
    data_index: Vec<IndexEntry>,

    levels: Vec<SummaryLevel>,

    utc_buf: Vec<UtcEntry>,
    utc_index: Vec<IndexEntry>,
    utc_last_sample_id: Option<i64>,

    ann_buf: Vec<Annotation>,
    ann_index: Vec<IndexEntry>,
    ann_last_timestamp: Option<i64>,
}

impl Track {
    pub fn new(def: SignalDef) -> Track {
        let levels = vec![SummaryLevel::new(1, &def)];
        Track {
            def,
            omit_data: false,
            next_rel_id: 0,
            buf: Vec::new(),
            bit_len: 0,
            buf_first_id: 0,
            buf_count: 0,
            buf_skips: Vec::new(),
            data_index: Vec::new(),
            levels,
            utc_buf: Vec::new(),
            utc_index: Vec::new(),
            utc_last_sample_id: None,
            ann_buf: Vec::new(),
            ann_index: Vec::new(),
            ann_last_timestamp: None,
        }
    }

    /// Timeline length so far (skip fill included).
    pub fn sample_count(&self) -> i64 {
        self.next_rel_id
    }

    /// Append samples at `rel_id` (relative to the signal's sample id
    /// offset), filling any gap with skip fill first.
    pub fn write_fsr<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        rel_id: i64,
        data: &[u8],
        samples: usize,
    ) -> SiglogResult<()> {
        if rel_id < self.next_rel_id {
            return Err(SiglogError::ParameterInvalid(format!(
                "signal {}: sample_id goes backwards ({} < {})",
                self.def.signal_id,
                rel_id,
                self.next_rel_id
            )));
        }
        if rel_id > self.next_rel_id {
            let gap = (rel_id - self.next_rel_id) as usize;
            log::debug!(
                "signal {}: skip fill of {} samples at {}",
                self.def.signal_id,
                gap,
                self.next_rel_id
            );
            self.append(cw, None, gap)?;
        }
        self.append(cw, Some(data), samples)
    }

    /// Append `samples` items to level 0 and run the summary cascade.
    /// `data == None` appends skip fill, which is excluded from statistics.
    fn append<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        data: Option<&[u8]>,
        samples: usize,
    ) -> SiglogResult<()> {
        let spd = self.def.samples_per_data;
        let bit_width = self.def.data_type.bit_width as usize;
        let mut remaining = samples;
        let mut src_pos = 0usize;
        while remaining > 0 {
            if self.buf_count == spd {
                self.flush_data_chunk(cw)?;
            }
            let space = (spd - self.buf_count) as usize;
            let take = remaining.min(space);
            let start = self.buf_count as usize;
            match data {
                Some(src) => {
                    data_type::copy_bits(
                        &mut self.buf,
                        self.bit_len,
                        src,
                        src_pos * bit_width,
                        take * bit_width,
                    );
                    self.bit_len += take * bit_width;
                }
                None => {
                    self.bit_len = self.def.data_type.append_fill(&mut self.buf, self.bit_len, take);
                    self.push_skip(start as u32, take as u32);
                }
            }
            self.buf_count += take as u32;
            for i in start..start + take {
                let value = if data.is_some() {
                    self.def.data_type.read_sample(&self.buf, i)
                } else {
                    f64::NAN
                };
                self.push_sample_stat(cw, value)?;
            }
            self.next_rel_id += take as i64;
            remaining -= take;
            src_pos += take;
        }
        Ok(())
    }

    fn push_skip(&mut self, start: u32, length: u32) {
        if let Some(last) = self.buf_skips.last_mut() {
            if last.start + last.length == start {
                last.length += length;
                return;
            }
        }
        self.buf_skips.push(SkipRange { start, length });
    }

    fn push_sample_stat<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        value: f64,
    ) -> SiglogResult<()> {
        let sdf = self.def.sample_decimate_factor;
        let level = &mut self.levels[0];
        level.pending.add(value);
        level.pending_children += 1;
        if level.pending_children == sdf {
            self.emit_entry(cw, 0, true)?;
        }
        Ok(())
    }

    /// Finalize the pending window of `levels[li]` into one entry, flush the
    /// level's buffer when full, and feed the entry into the parent level.
    /// `allow_grow` is false during finish so the tail never creates levels.
    fn emit_entry<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        li: usize,
        allow_grow: bool,
    ) -> SiglogResult<()> {
        let accum = {
            let level = &mut self.levels[li];
            let accum = level.pending;
            level.pending = SummaryAccum::new();
            level.pending_children = 0;
            accum
        };
        self.levels[li].entries.push(accum.entry());
        if self.levels[li].entries.len() as u32 == self.def.entries_per_summary {
            self.flush_summary_chunk(cw, li)?;
        }

        let parent = li + 1;
        if parent >= self.levels.len() {
            if allow_grow && self.levels.len() < MAX_LEVELS {
                self.levels.push(SummaryLevel::new((parent + 1) as u8, &self.def));
            } else {
                return Ok(());
            }
        }
        let full = {
            let plevel = &mut self.levels[parent];
            plevel.pending.merge(&accum);
            plevel.pending_children += 1;
            plevel.pending_children == self.def.summary_decimate_factor
        };
        if full {
            self.emit_entry(cw, parent, allow_grow)?;
        }
        Ok(())
    }

    fn flush_data_chunk<W: Write + Seek>(&mut self, cw: &mut ChunkWriter<W>) -> SiglogResult<()> {
        if self.buf_count == 0 {
            return Ok(());
        }
        if self.omit_data {
            self.buf.clear();
            self.buf_skips.clear();
        } else {
            let payload = DataPayload {
                first_sample_id: self.buf_first_id,
                sample_count: self.buf_count,
                skips: std::mem::take(&mut self.buf_skips),
                data: std::mem::take(&mut self.buf),
            };
            let bytes = records::to_vec(&payload)?;
            let offset = cw.write_chunk(tag::DATA, chunk_meta(self.def.signal_id, 0), &bytes)?;
            self.data_index.push(IndexEntry {
                offset,
                first_sample_id: self.buf_first_id,
            });
        }
        self.buf_first_id += self.buf_count as i64;
        self.buf_count = 0;
        self.bit_len = 0;
        Ok(())
    }

    fn flush_summary_chunk<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        li: usize,
    ) -> SiglogResult<()> {
        if self.levels[li].entries.is_empty() {
            return Ok(());
        }
        let (bytes, level_no, first_sample_id, entry_count) = {
            let level = &mut self.levels[li];
            let first_sample_id = level.first_entry_index * level.span as i64;
            let entry_count = level.entries.len() as i64;
            let payload = SummaryPayload {
                first_sample_id,
                entries: std::mem::take(&mut level.entries),
            };
            (records::to_vec(&payload)?, level.level, first_sample_id, entry_count)
        };
        let offset = cw.write_chunk(
            tag::SUMMARY,
            chunk_meta(self.def.signal_id, level_no),
            &bytes,
        )?;
        let level = &mut self.levels[li];
        level.index.push(IndexEntry {
            offset,
            first_sample_id,
        });
        level.first_entry_index += entry_count;
        Ok(())
    }

    pub fn write_utc<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        sample_id: i64,
        timestamp: i64,
    ) -> SiglogResult<()> {
        if let Some(last) = self.utc_last_sample_id {
            if sample_id <= last {
                return Err(SiglogError::ParameterInvalid(format!(
                    "signal {}: utc sample_id {} must be greater than {}",
                    self.def.signal_id,
                    sample_id,
                    last
                )));
            }
        }
        self.utc_last_sample_id = Some(sample_id);
        self.utc_buf.push(UtcEntry {
            sample_id,
            timestamp,
        });
        if self.utc_buf.len() as u32 == self.def.utc_decimate_factor {
            self.flush_utc_chunk(cw)?;
        }
        Ok(())
    }

    fn flush_utc_chunk<W: Write + Seek>(&mut self, cw: &mut ChunkWriter<W>) -> SiglogResult<()> {
        if self.utc_buf.is_empty() {
            return Ok(());
        }
        let first_sample_id = self.utc_buf[0].sample_id;
        let payload = UtcPayload {
            entries: std::mem::take(&mut self.utc_buf),
        };
        let bytes = records::to_vec(&payload)?;
        let offset = cw.write_chunk(tag::UTC, chunk_meta(self.def.signal_id, 0), &bytes)?;
        self.utc_index.push(IndexEntry {
            offset,
            first_sample_id,
        });
        Ok(())
    }

    pub fn write_annotation<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
        annotation: Annotation,
    ) -> SiglogResult<()> {
        if let Some(last) = self.ann_last_timestamp {
            if annotation.timestamp < last {
                return Err(SiglogError::ParameterInvalid(format!(
                    "signal {}: annotation timestamps must be non-decreasing ({} < {})",
                    self.def.signal_id,
                    annotation.timestamp,
                    last
                )));
            }
        }
        self.ann_last_timestamp = Some(annotation.timestamp);
        self.ann_buf.push(annotation);
        if self.ann_buf.len() as u32 == self.def.annotation_decimate_factor {
            self.flush_annotation_chunk(cw)?;
        }
        Ok(())
    }

    fn flush_annotation_chunk<W: Write + Seek>(
        &mut self,
        cw: &mut ChunkWriter<W>,
    ) -> SiglogResult<()> {
        if self.ann_buf.is_empty() {
            return Ok(());
        }
        let first_timestamp = self.ann_buf[0].timestamp;
        let payload = AnnotationPayload {
            entries: std::mem::take(&mut self.ann_buf),
        };
        let bytes = records::to_vec(&payload)?;
        let offset = cw.write_chunk(tag::ANNOTATION, chunk_meta(self.def.signal_id, 0), &bytes)?;
        self.ann_index.push(IndexEntry {
            offset,
            first_sample_id: first_timestamp,
        });
        Ok(())
    }

    /// Flush every partial buffer bottom-up and write the per-level index
    /// chunks. Tail windows become entries whose count is below the level
    /// factor; the tail never creates new levels.
    pub fn finish<W: Write + Seek>(&mut self, cw: &mut ChunkWriter<W>) -> SiglogResult<()> {
        let existing = self.levels.len();
        for li in 0..existing {
            if self.levels[li].pending_children > 0 {
                self.emit_entry(cw, li, false)?;
            }
        }
        self.flush_data_chunk(cw)?;
        for li in 0..self.levels.len() {
            self.flush_summary_chunk(cw, li)?;
        }

        let signal_id = self.def.signal_id;
        write_index(cw, tag::INDEX, chunk_meta(signal_id, 0), &self.data_index)?;
        for li in 0..self.levels.len() {
            let level_no = self.levels[li].level;
            let entries = std::mem::take(&mut self.levels[li].index);
            write_index(cw, tag::INDEX, chunk_meta(signal_id, level_no), &entries)?;
        }

        self.flush_utc_chunk(cw)?;
        write_index(cw, tag::UTC_INDEX, chunk_meta(signal_id, 0), &self.utc_index)?;
        self.flush_annotation_chunk(cw)?;
        write_index(
            cw,
            tag::ANNOTATION_INDEX,
            chunk_meta(signal_id, 0),
            &self.ann_index,
        )?;
        Ok(())
    }
}
