#![doc = include_str!("../README.md")]

pub mod chunk;
pub mod copy;
pub mod data_type;
pub mod read;
pub mod records;
mod ring;
pub mod stats;
pub mod threaded;
pub mod time;
mod track;
pub mod write;

use enumset::{EnumSet, EnumSetType};
use thiserror::Error;

pub use copy::copy;
pub use data_type::{BaseType, DataType};
pub use read::Reader;
pub use records::{
    Annotation, AnnotationType, SignalDef, SignalKind, SourceDef, StorageType, SummaryEntry,
    UtcEntry,
};
pub use threaded::ThreadedWriter;
pub use write::{WriteOptions, Writer};

/// Magic bytes starting every SigLog file.
pub const MAGIC: &[u8] = &[0x89, b'S', b'I', b'G', b'L', b'O', b'G', 0x1a];

/// On-disk format version written by this library.
pub const FORMAT_VERSION: u16 = 1;

/// Signal ids live in `1..=255`; id 0 is the implicit global annotation signal.
pub const MAX_SIGNAL_ID: u16 = 255;

/// Behavior flags for a writer session.
#[derive(EnumSetType, Debug)]
pub enum WriterFlag {
    /// When the command ring is full, drop incoming sample-data commands
    /// instead of blocking the producer. Control commands always block.
    DropOnOverflow,
}

pub type WriterFlags = EnumSet<WriterFlag>;

/// Stable integer error codes, kept for parity with the C bindings of the
/// format. `0` is OK; every [`SiglogError`] maps onto one code.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    ParameterInvalid = 1,
    NotFound = 2,
    AlreadyExists = 3,
    Io = 4,
    CrcMismatch = 5,
    Truncated = 6,
    UnsupportedVersion = 7,
    Unsupported = 8,
    Overflow = 9,
    Busy = 10,
    NotSupported = 11,
    Abort = 12,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::ParameterInvalid => "PARAMETER_INVALID",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Io => "IO",
            ErrorCode::CrcMismatch => "CRC_MISMATCH",
            ErrorCode::Truncated => "TRUNCATED",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::Overflow => "OVERFLOW",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NotSupported => "NOT_SUPPORTED",
            ErrorCode::Abort => "ABORT",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "success",
            ErrorCode::ParameterInvalid => "a provided parameter was invalid",
            ErrorCode::NotFound => "the requested entity does not exist",
            ErrorCode::AlreadyExists => "the entity was already defined",
            ErrorCode::Io => "an operating-system i/o operation failed",
            ErrorCode::CrcMismatch => "a stored checksum did not match the data",
            ErrorCode::Truncated => "the file ends before a complete record",
            ErrorCode::UnsupportedVersion => "the file format version is not supported",
            ErrorCode::Unsupported => "the operation is not supported for this entity",
            ErrorCode::Overflow => "the command ring buffer overflowed",
            ErrorCode::Busy => "the resource is busy",
            ErrorCode::NotSupported => "the operation is not supported",
            ErrorCode::Abort => "the writer aborted",
        }
    }
}

#[derive(Debug, Error)]
pub enum SiglogError {
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crc mismatch at offset {offset}: saved {saved:#010x}, calculated {calculated:#010x}")]
    CrcMismatch {
        offset: u64,
        saved: u32,
        calculated: u32,
    },

    #[error("file is truncated or contains no valid chunks")]
    Truncated,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("command ring overflow")]
    Overflow,

    #[error("resource busy")]
    Busy,

    #[error("operation not supported")]
    NotSupported,

    #[error("writer aborted: {0}")]
    Abort(String),

    #[error("record parse failed: {0}")]
    Parse(String),
}

impl From<binrw::Error> for SiglogError {
    fn from(err: binrw::Error) -> Self {
        SiglogError::Parse(err.to_string())
    }
}

impl SiglogError {
    /// The stable integer code for this error (see [`ErrorCode`]).
    pub fn code(&self) -> ErrorCode {
        match self {
            SiglogError::ParameterInvalid(_) => ErrorCode::ParameterInvalid,
            SiglogError::NotFound(_) => ErrorCode::NotFound,
            SiglogError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SiglogError::Io(_) => ErrorCode::Io,
            SiglogError::CrcMismatch { .. } => ErrorCode::CrcMismatch,
            SiglogError::Truncated => ErrorCode::Truncated,
            SiglogError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            SiglogError::Unsupported(_) => ErrorCode::Unsupported,
            SiglogError::Overflow => ErrorCode::Overflow,
            SiglogError::Busy => ErrorCode::Busy,
            SiglogError::NotSupported => ErrorCode::NotSupported,
            SiglogError::Abort(_) => ErrorCode::Abort,
            SiglogError::Parse(_) => ErrorCode::Io,
        }
    }

    /// Rebuild an error from a stored `(code, message)` pair. Used by the
    /// threaded writer to surface the worker's first error to the producer.
    pub(crate) fn from_code(code: ErrorCode, message: String) -> SiglogError {
        match code {
            ErrorCode::Ok | ErrorCode::ParameterInvalid => SiglogError::ParameterInvalid(message),
            ErrorCode::NotFound => SiglogError::NotFound(message),
            ErrorCode::AlreadyExists => SiglogError::AlreadyExists(message),
            ErrorCode::Io => SiglogError::Parse(message),
            ErrorCode::CrcMismatch => SiglogError::Abort(message),
            ErrorCode::Truncated => SiglogError::Truncated,
            ErrorCode::UnsupportedVersion => SiglogError::Abort(message),
            ErrorCode::Unsupported => SiglogError::Unsupported(message),
            ErrorCode::Overflow => SiglogError::Overflow,
            ErrorCode::Busy => SiglogError::Busy,
            ErrorCode::NotSupported => SiglogError::NotSupported,
            ErrorCode::Abort => SiglogError::Abort(message),
        }
    }
}

pub type SiglogResult<T> = Result<T, SiglogError>;
