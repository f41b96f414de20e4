//! Raw chunk I/O.
//!
//! Every on-disk record is a chunk: a fixed 32-byte header, a payload CRC
//! trailer, the payload, and zero padding up to the next 8-byte boundary.
//! Chunks of one kind form doubly linked chains so readers can walk a chain
//! forward via `offset_next` (back-patched into the previous chunk) or
//! reverse via `offset_prev`/`payload_prev_length`.
//!
//! Header layout (all little-endian, chunk start 8-aligned):
//!
//! | bytes | field |
//! |-------|-------|
//! | 0..8   | `offset_next` (0 until patched) |
//! | 8..16  | `offset_prev` |
//! | 16     | `tag` |
//! | 17     | reserved |
//! | 18..20 | `chunk_meta` |
//! | 20..24 | `payload_length` |
//! | 24..28 | `payload_prev_length` |
//! | 28..32 | `header_crc` (CRC32C over bytes 0..28) |
//!
//! The header CRC validates independently of the payload, so a torn payload
//! write is detected without losing the chain, and the open-time scan can
//! skip to the next header candidate.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use static_assertions::const_assert_eq;

use crate::records::tag;
use crate::{SiglogError, SiglogResult, FORMAT_VERSION, MAGIC};

/// File header: magic, version, root index offset (patched at close),
/// creation time.
pub const FILE_HEADER_SIZE: u64 = 32;
pub const CHUNK_HEADER_SIZE: u64 = 32;
/// Header plus the payload CRC trailer.
pub const PAYLOAD_PREFIX_SIZE: u64 = CHUNK_HEADER_SIZE + 4;

/// Byte offset of the root index offset within the file header; 8-aligned so
/// the close-time patch is a single aligned store.
const ROOT_INDEX_FIELD_OFFSET: u64 = 16;

const_assert_eq!(FILE_HEADER_SIZE % 8, 0);
const_assert_eq!(CHUNK_HEADER_SIZE % 8, 0);
const_assert_eq!(ROOT_INDEX_FIELD_OFFSET % 8, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub offset_next: u64,
    pub offset_prev: u64,
    pub tag: u8,
    pub chunk_meta: u16,
    pub payload_length: u32,
    pub payload_prev_length: u32,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE as usize] {
        let mut b = [0u8; CHUNK_HEADER_SIZE as usize];
        b[0..8].copy_from_slice(&self.offset_next.to_le_bytes());
        b[8..16].copy_from_slice(&self.offset_prev.to_le_bytes());
        b[16] = self.tag;
        b[18..20].copy_from_slice(&self.chunk_meta.to_le_bytes());
        b[20..24].copy_from_slice(&self.payload_length.to_le_bytes());
        b[24..28].copy_from_slice(&self.payload_prev_length.to_le_bytes());
        let crc = crc32c::crc32c(&b[..28]);
        b[28..32].copy_from_slice(&crc.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8; CHUNK_HEADER_SIZE as usize], offset: u64) -> SiglogResult<ChunkHeader> {
        let saved = u32::from_le_bytes([b[28], b[29], b[30], b[31]]);
        let calculated = crc32c::crc32c(&b[..28]);
        if saved != calculated {
            return Err(SiglogError::CrcMismatch {
                offset,
                saved,
                calculated,
            });
        }
        Ok(ChunkHeader {
            offset_next: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            offset_prev: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            tag: b[16],
            chunk_meta: u16::from_le_bytes([b[18], b[19]]),
            payload_length: u32::from_le_bytes(b[20..24].try_into().unwrap()),
            payload_prev_length: u32::from_le_bytes(b[24..28].try_into().unwrap()),
        })
    }

    /// Total on-disk size of this chunk, padding included.
    pub fn total_size(&self) -> u64 {
        (PAYLOAD_PREFIX_SIZE + self.payload_length as u64 + 7) & !7
    }
}

/// Chains are keyed per (tag, group): signal|level for data/summary/index
/// chunks, signal for annotation/UTC chunks, 0 for the file-wide chains.
pub(crate) fn chain_group(chunk_tag: u8, chunk_meta: u16) -> u16 {
    match chunk_tag {
        tag::DATA | tag::SUMMARY | tag::INDEX => chunk_meta,
        tag::ANNOTATION | tag::ANNOTATION_INDEX | tag::UTC | tag::UTC_INDEX => chunk_meta & 0x00ff,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy)]
struct ChainState {
    head: u64,
    tail: u64,
    tail_header: ChunkHeader,
}

/// Appends chunks to a file, maintaining the per-chain linked lists.
pub struct ChunkWriter<W: Write + Seek> {
    w: W,
    pos: u64,
    chains: HashMap<(u8, u16), ChainState>,
}

impl<W: Write + Seek> ChunkWriter<W> {
    /// Write the file header (root index offset 0) and position for the
    /// first chunk.
    pub fn new(mut w: W, creation_time: i64) -> SiglogResult<Self> {
        let mut header = [0u8; FILE_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[24..32].copy_from_slice(&creation_time.to_le_bytes());
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&header)?;
        Ok(ChunkWriter {
            w,
            pos: FILE_HEADER_SIZE,
            chains: HashMap::new(),
        })
    }

    /// The file offset the next chunk will land at.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Append one chunk, linking it into its chain, and return its offset.
    pub fn write_chunk(&mut self, chunk_tag: u8, chunk_meta: u16, payload: &[u8]) -> SiglogResult<u64> {
        let offset = self.pos;
        debug_assert_eq!(offset % 8, 0);
        let key = (chunk_tag, chain_group(chunk_tag, chunk_meta));
        let prev = self.chains.get(&key).copied();

        let header = ChunkHeader {
            offset_next: 0,
            offset_prev: prev.map(|c| c.tail).unwrap_or(0),
            tag: chunk_tag,
            chunk_meta,
            payload_length: payload.len() as u32,
            payload_prev_length: prev.map(|c| c.tail_header.payload_length).unwrap_or(0),
        };

        // Patch the previous chunk of this chain before the new bytes land:
        // one aligned u64 store for offset_next, then the header CRC rewrite.
        if let Some(mut prev) = prev {
            prev.tail_header.offset_next = offset;
            let bytes = prev.tail_header.encode();
            log::trace!(
                "patching chunk at {} (tag {:#04x}) offset_next -> {}",
                prev.tail,
                chunk_tag,
                offset
            );
            self.w.seek(SeekFrom::Start(prev.tail))?;
            self.w.write_all(&bytes[0..8])?;
            self.w.seek(SeekFrom::Start(prev.tail + 28))?;
            self.w.write_all(&bytes[28..32])?;
        }

        self.w.seek(SeekFrom::Start(offset))?;
        self.w.write_all(&header.encode())?;
        self.w.write_u32::<LE>(crc32c::crc32c(payload))?;
        self.w.write_all(payload)?;
        let total = PAYLOAD_PREFIX_SIZE + payload.len() as u64;
        let padded = (total + 7) & !7;
        if padded > total {
            const ZEROS: [u8; 8] = [0; 8];
            self.w.write_all(&ZEROS[..(padded - total) as usize])?;
        }
        self.pos = offset + padded;

        match self.chains.get_mut(&key) {
            Some(state) => {
                state.tail = offset;
                state.tail_header = header;
            }
            None => {
                self.chains.insert(
                    key,
                    ChainState {
                        head: offset,
                        tail: offset,
                        tail_header: header,
                    },
                );
            }
        }
        Ok(offset)
    }

    /// Head/tail offsets of every chain written so far, for the end record.
    pub(crate) fn chain_heads(&self) -> Vec<crate::records::ChainHead> {
        let mut heads: Vec<_> = self
            .chains
            .iter()
            .map(|((chunk_tag, group), state)| crate::records::ChainHead {
                tag: *chunk_tag,
                signal_id: (group & 0x00ff) as u8,
                level: group >> 8,
                head: state.head,
                tail: state.tail,
            })
            .collect();
        heads.sort_by_key(|h| (h.tag, h.signal_id, h.level));
        heads
    }

    /// Patch the file header's root index offset. Done last so a crash
    /// beforehand leaves a readable-but-incomplete file.
    pub fn patch_root_index(&mut self, offset: u64) -> SiglogResult<()> {
        self.w.seek(SeekFrom::Start(ROOT_INDEX_FIELD_OFFSET))?;
        self.w.write_u64::<LE>(offset)?;
        self.w.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub fn flush(&mut self) -> SiglogResult<()> {
        self.w.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub root_index_offset: u64,
    pub creation_time: i64,
}

fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> SiglogResult<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SiglogError::Truncated
        } else {
            SiglogError::Io(e)
        }
    })
}

pub fn read_file_header<R: Read + Seek>(r: &mut R) -> SiglogResult<FileHeader> {
    r.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    read_exact_or_truncated(r, &mut buf)?;
    if &buf[0..8] != MAGIC {
        return Err(SiglogError::Parse("bad magic: not a siglog file".into()));
    }
    Ok(FileHeader {
        version: u16::from_le_bytes([buf[8], buf[9]]),
        root_index_offset: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        creation_time: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
    })
}

/// Read and validate the chunk header at `offset`.
pub fn read_header_at<R: Read + Seek>(r: &mut R, offset: u64) -> SiglogResult<ChunkHeader> {
    r.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
    read_exact_or_truncated(r, &mut buf)?;
    ChunkHeader::decode(&buf, offset)
}

/// Read the chunk at `offset`, validating both CRCs.
pub fn read_chunk_at<R: Read + Seek>(
    r: &mut R,
    offset: u64,
) -> SiglogResult<(ChunkHeader, Vec<u8>)> {
    let header = read_header_at(r, offset)?;
    let saved = r.read_u32::<LE>().map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SiglogError::Truncated
        } else {
            SiglogError::Io(e)
        }
    })?;
    let mut payload = vec![0u8; header.payload_length as usize];
    read_exact_or_truncated(r, &mut payload)?;
    let calculated = crc32c::crc32c(&payload);
    if saved != calculated {
        return Err(SiglogError::CrcMismatch {
            offset,
            saved,
            calculated,
        });
    }
    Ok((header, payload))
}

/// Walks a chain forward from its head. An unreadable chunk yields the error
/// and terminates the walk.
pub struct ChainIter<'r, R> {
    r: &'r mut R,
    next: u64,
    failed: bool,
}

impl<'r, R: Read + Seek> ChainIter<'r, R> {
    pub fn new(r: &'r mut R, head: u64) -> Self {
        ChainIter {
            r,
            next: head,
            failed: false,
        }
    }
}

impl<R: Read + Seek> Iterator for ChainIter<'_, R> {
    type Item = SiglogResult<(u64, ChunkHeader, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next == 0 {
            return None;
        }
        let offset = self.next;
        match read_chunk_at(self.r, offset) {
            Ok((header, payload)) => {
                self.next = header.offset_next;
                Some(Ok((offset, header, payload)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
