//! Status codes and error types for kvpool operations
//!
//! Every engine operation resolves to exactly one [`Status`]. Failures are
//! carried as [`KvError`], which keeps enough context for a useful diagnostic
//! message and maps back to its status with [`KvError::status`].
//!
//! Absence is not an error: reads return `Option`/`bool`, and `NotFound`
//! only appears as a status at the C boundary or through [`Status::of`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Outcome of an engine operation.
///
/// The integer values are part of the external contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    UnknownError = 1,
    /// The key is absent. Not a failure.
    NotFound = 2,
    NotSupported = 3,
    InvalidArgument = 4,
    ConfigParsingError = 5,
    ConfigTypeError = 6,
    /// A visitor asked to stop the traversal.
    StoppedByCb = 7,
    OutOfMemory = 8,
    WrongEngineName = 9,
}

impl Status {
    /// Every status, in integer order.
    pub const ALL: [Status; 10] = [
        Status::Ok,
        Status::UnknownError,
        Status::NotFound,
        Status::NotSupported,
        Status::InvalidArgument,
        Status::ConfigParsingError,
        Status::ConfigTypeError,
        Status::StoppedByCb,
        Status::OutOfMemory,
        Status::WrongEngineName,
    ];

    /// Integer code exposed to callers across the C boundary.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Status::code`].
    pub fn from_code(code: i32) -> Option<Status> {
        Status::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Constant-table name, e.g. `"NOT_FOUND"`.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::UnknownError => "UNKNOWN_ERROR",
            Status::NotFound => "NOT_FOUND",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::ConfigParsingError => "CONFIG_PARSING_ERROR",
            Status::ConfigTypeError => "CONFIG_TYPE_ERROR",
            Status::StoppedByCb => "STOPPED_BY_CB",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::WrongEngineName => "WRONG_ENGINE_NAME",
        }
    }

    /// Status of an operation result.
    ///
    /// `Ok(None)` and `Ok(false)` are not distinguishable here; use the
    /// dedicated helpers on [`crate::Database`] when absence matters.
    pub fn of<T>(result: &KvResult<T>) -> Status {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// kvpool error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// No engine is registered under this name
    #[error("unknown engine name: {0:?}")]
    WrongEngineName(String),

    /// Config text could not be parsed, or a required option is missing
    #[error("config parsing error: {0}")]
    ConfigParsing(String),

    /// A config value has the wrong type
    #[error("config option {key:?} has wrong type: expected {expected}")]
    ConfigType {
        key: String,
        expected: &'static str,
    },

    /// The caller passed an argument the engine cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine does not implement this capability
    #[error("operation {operation} is not supported by engine {engine:?}")]
    NotSupported {
        operation: &'static str,
        engine: String,
    },

    /// A visitor requested early termination
    #[error("iteration stopped by callback")]
    StoppedByCallback,

    /// The write would exceed the pool capacity
    #[error("pool capacity exceeded: {requested} more bytes requested, {used} of {capacity} in use")]
    OutOfMemory {
        requested: u64,
        used: u64,
        capacity: u64,
    },

    /// A caller-provided buffer cannot hold the value
    #[error("buffer too small: value is {needed} bytes, buffer holds {available}")]
    BufferTooSmall { needed: u64, available: u64 },

    /// The database handle was stopped
    #[error("database is stopped")]
    Stopped,

    /// Another live instance holds the pool
    #[error("pool is locked by another instance: {}", .path.display())]
    PoolLocked { path: PathBuf },

    /// I/O operation failed
    #[error("{}", io_message(.path, .message, .kind))]
    Io {
        path: Option<PathBuf>,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// WAL or checkpoint content is corrupted and cannot be used
    #[error("log corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Partial record at the end of a file
    #[error("torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Key or value larger than the configured limit
    #[error("{component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        component: &'static str,
    },
}

fn io_message(path: &Option<PathBuf>, message: &str, kind: &std::io::ErrorKind) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

impl KvError {
    /// The status this error reports across the boundary.
    pub fn status(&self) -> Status {
        match self {
            KvError::WrongEngineName(_) => Status::WrongEngineName,
            KvError::ConfigParsing(_) => Status::ConfigParsingError,
            KvError::ConfigType { .. } => Status::ConfigTypeError,
            KvError::InvalidArgument(_) | KvError::OversizedEntry { .. } | KvError::Stopped => {
                Status::InvalidArgument
            }
            KvError::NotSupported { .. } => Status::NotSupported,
            KvError::StoppedByCallback => Status::StoppedByCb,
            KvError::OutOfMemory { .. } | KvError::BufferTooSmall { .. } => Status::OutOfMemory,
            KvError::PoolLocked { .. }
            | KvError::Io { .. }
            | KvError::WalCorrupted { .. }
            | KvError::ChecksumMismatch { .. }
            | KvError::TornWrite { .. } => Status::UnknownError,
        }
    }

    /// Wrap an I/O error with the file it happened on.
    pub(crate) fn io(path: impl Into<PathBuf>, context: &str, err: std::io::Error) -> Self {
        KvError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        }
    }

    pub(crate) fn not_supported(operation: &'static str, engine: &str) -> Self {
        KvError::NotSupported {
            operation,
            engine: engine.to_string(),
        }
    }
}

/// Convert std::io::Error to KvError::Io
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for kvpool operations
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::NotFound.code(), 2);
        assert_eq!(Status::StoppedByCb.code(), 7);
        assert_eq!(Status::WrongEngineName.code(), 9);
        for (i, status) in Status::ALL.iter().enumerate() {
            assert_eq!(status.code(), i as i32);
            assert_eq!(Status::from_code(i as i32), Some(*status));
        }
        assert_eq!(Status::from_code(42), None);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(Status::ConfigTypeError.name(), "CONFIG_TYPE_ERROR");
        assert_eq!(Status::OutOfMemory.to_string(), "OUT_OF_MEMORY");
    }

    #[test]
    fn test_error_display() {
        let err = KvError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.wal"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = err.to_string();
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
        assert_eq!(err.status(), Status::UnknownError);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(KvError::WrongEngineName("nope".into()).status(), Status::WrongEngineName);
        assert_eq!(KvError::StoppedByCallback.status(), Status::StoppedByCb);
        assert_eq!(KvError::Stopped.status(), Status::InvalidArgument);
        let oom = KvError::OutOfMemory { requested: 10, used: 5, capacity: 8 };
        assert_eq!(oom.status(), Status::OutOfMemory);
        assert!(oom.to_string().contains("capacity"));
        let small = KvError::BufferTooSmall { needed: 12, available: 4 };
        assert_eq!(small.status(), Status::OutOfMemory);
        assert_eq!(small.to_string(), "buffer too small: value is 12 bytes, buffer holds 4");
    }

    #[test]
    fn test_status_of_result() {
        let ok: KvResult<()> = Ok(());
        let err: KvResult<()> = Err(KvError::not_supported("count_above", "cmap"));
        assert_eq!(Status::of(&ok), Status::Ok);
        assert_eq!(Status::of(&err), Status::NotSupported);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let kv_err: KvError = io_err.into();

        match kv_err {
            KvError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }
}
