//! Log file abstraction
//!
//! A LogFile is one append-only file holding a contiguous run of encoded
//! entries, addressed by a monotonically increasing file id. The file is
//! pre-sized to the configured cap at open so that memory-mapped I/O is
//! legal over the whole region; the unwritten tail reads as zeroes, which
//! the entry reader reports as EndOfEntries.
//!
//! Files are not self-describing: the data type is encoded in the filename,
//! `log.<typename>.<fid:09>`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::IoType;
use crate::entry::{self, LogEntry, MAX_HEADER_SIZE};
use crate::error::{BarrelError, BarrelResult};
use crate::index::DataType;
use crate::ioselector::{FileIo, IoSelector, MmapIo};

/// Filename prefix shared by every log file.
pub const FILE_PREFIX: &str = "log.";

/// A single append-only log file.
pub struct LogFile {
    /// Monotonically increasing file id within one data type
    pub fid: u32,
    /// Offset of the next append
    write_at: AtomicU64,
    io: Box<dyn IoSelector>,
}

/// Build the on-disk filename for a (type, fid) pair.
pub fn log_file_name(dir: &Path, fid: u32, data_type: DataType) -> PathBuf {
    dir.join(format!("{}{}.{:09}", FILE_PREFIX, data_type.file_name(), fid))
}

impl LogFile {
    /// Open (or create) the log file for `(data_type, fid)` under `dir`,
    /// pre-sized to `fsize` bytes, backed by the selected I/O kind.
    pub fn open(
        dir: &Path,
        fid: u32,
        fsize: u64,
        data_type: DataType,
        io_type: IoType,
    ) -> BarrelResult<Self> {
        let path = log_file_name(dir, fid, data_type);
        let io: Box<dyn IoSelector> = match io_type {
            IoType::FileIo => Box::new(FileIo::open(&path, fsize)?),
            IoType::Mmap => Box::new(MmapIo::open(&path, fsize)?),
        };
        Ok(Self { fid, write_at: AtomicU64::new(0), io })
    }

    /// Offset of the next append.
    pub fn write_at(&self) -> u64 {
        self.write_at.load(Ordering::Acquire)
    }

    /// Reposition the append offset. Used once per file during recovery,
    /// after replay has located the end of the valid entry run.
    pub fn set_write_at(&self, offset: u64) {
        self.write_at.store(offset, Ordering::Release);
    }

    /// Append `buf` at the current write offset. Returns the offset the
    /// buffer landed at. A backend that reports fewer bytes written than
    /// requested fails the operation.
    pub fn write(&self, buf: &[u8]) -> BarrelResult<u64> {
        if buf.is_empty() {
            return Ok(self.write_at());
        }
        let offset = self.write_at.load(Ordering::Acquire);
        let n = self.io.write(buf, offset)?;
        if n != buf.len() {
            return Err(BarrelError::WriteSizeNotEqual { expected: buf.len(), written: n });
        }
        self.write_at.fetch_add(n as u64, Ordering::AcqRel);
        Ok(offset)
    }

    /// Positioned read of a raw byte range.
    pub fn read(&self, offset: u64, size: usize) -> BarrelResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.read_bytes(offset, size)
    }

    /// Read and decode the entry at `offset`. Returns the entry and the
    /// number of bytes it occupies on disk.
    ///
    /// Reaching the pre-allocated zero tail (or the end of the region)
    /// yields EndOfEntries; a checksum mismatch yields InvalidCrc.
    pub fn read_entry(&self, offset: u64) -> BarrelResult<(LogEntry, usize)> {
        let header_buf = self.read_bytes(offset, MAX_HEADER_SIZE)?;
        let (header, header_len) =
            entry::decode_header(&header_buf).ok_or(BarrelError::EndOfEntries)?;

        // All-zero decoded header means the tail of the pre-sized file.
        if header.crc32 == 0 && header.ksize == 0 && header.vsize == 0 {
            return Err(BarrelError::EndOfEntries);
        }

        let ksize = header.ksize as usize;
        let vsize = header.vsize as usize;
        let mut e = LogEntry {
            expire_at: header.expire_at,
            typ: header.typ,
            ..Default::default()
        };

        if ksize > 0 || vsize > 0 {
            let kv = self.read_bytes(offset + header_len as u64, ksize + vsize)?;
            e.key = kv[..ksize].to_vec();
            e.value = kv[ksize..].to_vec();
        }

        if entry::entry_crc(&e, &header_buf[4..header_len]) != header.crc32 {
            return Err(BarrelError::InvalidCrc { fid: self.fid, offset });
        }
        Ok((e, header_len + ksize + vsize))
    }

    pub fn sync(&self) -> BarrelResult<()> {
        self.io.sync()
    }

    pub fn close(&self) -> BarrelResult<()> {
        self.io.close()
    }

    pub fn delete(&self) -> BarrelResult<()> {
        self.io.delete()
    }

    fn read_bytes(&self, offset: u64, n: usize) -> BarrelResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let read = self.io.read(&mut buf, offset)?;
        if read < n {
            return Err(BarrelError::EndOfEntries);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{encode_entry, EntryType};
    use tempfile::TempDir;

    fn entry(key: &[u8], value: &[u8]) -> LogEntry {
        LogEntry { key: key.to_vec(), value: value.to_vec(), expire_at: 0, typ: EntryType::Normal }
    }

    #[test]
    fn test_file_naming() {
        let name = log_file_name(Path::new("/data"), 42, DataType::Set);
        assert_eq!(name, Path::new("/data/log.sets.000000042"));
    }

    #[test]
    fn test_append_and_read_entries() {
        let dir = TempDir::new().unwrap();
        for io_type in [IoType::FileIo, IoType::Mmap] {
            let lf = LogFile::open(dir.path(), 0, 1 << 16, DataType::String, io_type).unwrap();

            let (buf1, size1) = encode_entry(&entry(b"alpha", b"1"));
            let (buf2, size2) = encode_entry(&entry(b"beta", b"2"));
            let off1 = lf.write(&buf1).unwrap();
            let off2 = lf.write(&buf2).unwrap();
            assert_eq!(off1, 0);
            assert_eq!(off2, size1 as u64);
            assert_eq!(lf.write_at(), (size1 + size2) as u64);

            let (e, consumed) = lf.read_entry(off1).unwrap();
            assert_eq!(e.key, b"alpha");
            assert_eq!(consumed, size1);
            let (e, _) = lf.read_entry(off2).unwrap();
            assert_eq!(e.value, b"2");

            lf.delete().unwrap();
        }
    }

    #[test]
    fn test_zero_tail_is_end_of_entries() {
        let dir = TempDir::new().unwrap();
        let lf = LogFile::open(dir.path(), 1, 4096, DataType::Hash, IoType::FileIo).unwrap();
        let (buf, size) = encode_entry(&entry(b"k", b"v"));
        lf.write(&buf).unwrap();

        let result = lf.read_entry(size as u64);
        assert!(matches!(result, Err(BarrelError::EndOfEntries)));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let lf = LogFile::open(dir.path(), 2, 4096, DataType::List, IoType::FileIo).unwrap();
        let (buf, size) = encode_entry(&entry(b"key", b"payload"));
        lf.write(&buf).unwrap();

        // Corrupt one payload byte behind the log file's back.
        use std::io::{Seek, SeekFrom, Write};
        let path = log_file_name(dir.path(), 2, DataType::List);
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(size as u64 - 1)).unwrap();
        f.write_all(&[0xFF]).unwrap();
        drop(f);

        let result = lf.read_entry(0);
        assert!(matches!(result, Err(BarrelError::InvalidCrc { fid: 2, .. })));
    }

    #[test]
    fn test_reopen_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let (buf, size) = encode_entry(&entry(b"persist", b"me"));
        {
            let lf = LogFile::open(dir.path(), 3, 4096, DataType::ZSet, IoType::FileIo).unwrap();
            lf.write(&buf).unwrap();
            lf.sync().unwrap();
        }
        let lf = LogFile::open(dir.path(), 3, 4096, DataType::ZSet, IoType::FileIo).unwrap();
        // A reopened file starts with write_at 0; recovery repositions it.
        assert_eq!(lf.write_at(), 0);
        let (e, consumed) = lf.read_entry(0).unwrap();
        assert_eq!(e.key, b"persist");
        assert_eq!(consumed, size);
        lf.set_write_at(consumed as u64);
        assert_eq!(lf.write_at(), consumed as u64);
    }
}
