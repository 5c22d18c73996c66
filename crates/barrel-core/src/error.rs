//! Error types for Barrel operations
//!
//! All engine errors are represented by the BarrelError enum, which carries
//! enough context (path, file id, offset) to diagnose a failure without a
//! debugger attached.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Barrel error types with detailed context
#[derive(Debug, Clone)]
pub enum BarrelError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Logical absence: the key was deleted, expired, or never written
    KeyNotFound,

    /// The index refers to a file id that is no longer open
    LogFileNotFound {
        /// File id the index pointed at
        fid: u32,
    },

    /// Entry checksum verification failed
    InvalidCrc {
        /// File id holding the corrupt entry
        fid: u32,
        /// Byte offset of the entry
        offset: u64,
    },

    /// The pre-allocated zero region at the tail of a log file was reached.
    /// Callers treat this as clean end-of-file.
    EndOfEntries,

    /// The I/O backend wrote fewer bytes than requested
    WriteSizeNotEqual {
        /// Bytes the caller asked to write
        expected: usize,
        /// Bytes the backend reported written
        written: usize,
    },

    /// Invalid configuration rejected at open
    Config {
        /// Description of the rejected option
        message: String,
    },

    /// An operation received the wrong number of arguments
    WrongNumberOfArgs {
        /// Operation name, for the caller's error message
        cmd: &'static str,
    },

    /// The stored value is not an integer
    WrongValueType,

    /// Increment or decrement would overflow an i64
    IntegerOverflow,

    /// List index outside the live range
    IndexOutOfRange,

    /// List range start is greater than its end
    IndexStartGreaterThanEnd,

    /// A log file GC is already in flight
    GcRunning,

    /// The engine has been closed; no further operations are accepted
    DbClosed,

    /// The discard table has no free slot for a new log file
    DiscardNoSpace,
}

impl fmt::Display for BarrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrelError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            BarrelError::KeyNotFound => write!(f, "key not found"),

            BarrelError::LogFileNotFound { fid } => {
                write!(f, "log file not found for fid {}", fid)
            }

            BarrelError::InvalidCrc { fid, offset } => {
                write!(f, "invalid crc32 in log file {} at offset {}", fid, offset)
            }

            BarrelError::EndOfEntries => write!(f, "end of entries in log file"),

            BarrelError::WriteSizeNotEqual { expected, written } => {
                write!(f, "short write: expected {} bytes, wrote {}", expected, written)
            }

            BarrelError::Config { message } => write!(f, "invalid options: {}", message),

            BarrelError::WrongNumberOfArgs { cmd } => {
                write!(f, "wrong number of arguments for {}", cmd)
            }

            BarrelError::WrongValueType => write!(f, "value is not an integer"),

            BarrelError::IntegerOverflow => write!(f, "increment or decrement overflow"),

            BarrelError::IndexOutOfRange => write!(f, "list index out of range"),

            BarrelError::IndexStartGreaterThanEnd => {
                write!(f, "list range start is greater than end")
            }

            BarrelError::GcRunning => write!(f, "log file gc is running, retry later"),

            BarrelError::DbClosed => write!(f, "the database instance is closed"),

            BarrelError::DiscardNoSpace => {
                write!(f, "no free slot left in the discard table")
            }
        }
    }
}

impl Error for BarrelError {}

/// Convert std::io::Error to BarrelError::Io
impl From<std::io::Error> for BarrelError {
    fn from(err: std::io::Error) -> Self {
        BarrelError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for Barrel operations
pub type BarrelResult<T> = Result<T, BarrelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BarrelError::InvalidCrc { fid: 7, offset: 4096 };
        let display = format!("{}", err);
        assert!(display.contains("invalid crc32"));
        assert!(display.contains("7"));
        assert!(display.contains("4096"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BarrelError = io_err.into();

        match err {
            BarrelError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_short_write_display() {
        let err = BarrelError::WriteSizeNotEqual { expected: 64, written: 12 };
        let display = format!("{}", err);
        assert!(display.contains("64"));
        assert!(display.contains("12"));
    }
}
