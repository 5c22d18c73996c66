//! Barrel Core — Log-Structured Typed Key-Value Engine
//!
//! A persistent, embeddable key-value store in the Bitcask tradition:
//! every mutation appends to a per-type log file, an in-memory Adaptive
//! Radix Tree maps each live key to its latest position, and a background
//! garbage collector rewrites live entries out of files dominated by dead
//! bytes.
//!
//! # Architecture
//!
//! - **Write path**: encode entry -> append to the type's active log
//!   (rotating at the size cap) -> update the index -> forward the
//!   superseded position to the discard table
//! - **Read path**: index lookup -> expiry check -> positioned read from
//!   the log (or the inline value in KeyValueMem mode)
//! - **Recovery**: replay every log in ascending file-id order to rebuild
//!   the indexes; CRC mismatches truncate a file's tail
//! - **Background**: one GC thread reclaims files past the discard-ratio
//!   threshold
//!
//! Five value types (strings, lists, hashes, sets, sorted sets) share the
//! same log-structured substrate, partitioned into per-type log files.

pub mod art;
pub mod config;
pub mod discard;
pub mod engine;
pub mod entry;
pub mod error;
pub mod flock;
pub mod index;
pub mod ioselector;
pub mod logfile;
pub mod sorted_set;
pub mod util;

mod gc;
mod hash;
mod list;
mod sets;
mod strs;
mod zset;

// Re-export key types for convenience
pub use config::{IndexMode, IoType, Options};
pub use engine::BarrelEngine;
pub use entry::{EntryType, LogEntry};
pub use error::{BarrelError, BarrelResult};
pub use index::DataType;
