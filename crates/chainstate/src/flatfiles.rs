//! Append-only flat files holding block and undo payloads.
//!
//! Each record is `magic(4) | size(4 LE) | payload`. Files roll over at
//! a size bound and are preallocated in chunks so appends rarely grow
//! the file mid-write.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kestrel_primitives::encoding::{DecodeError, Decoder, Encoder};

pub const MAX_FLATFILE_SIZE: u64 = 128 * 1024 * 1024;
pub const FLATFILE_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Position of one record: file id plus byte offset of its magic.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FileLocation {
    pub file: u32,
    pub offset: u64,
}

impl FileLocation {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file);
        encoder.write_u64_le(self.offset);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            file: decoder.read_u32_le()?,
            offset: decoder.read_u64_le()?,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(io::Error),
    Corrupt(&'static str),
}

impl fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "{err}"),
            FlatFileError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<io::Error> for FlatFileError {
    fn from(err: io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    max_record_size: u32,
    last_file: u32,
    last_len: u64,
}

impl FlatFileStore {
    pub fn open(
        dir: impl AsRef<Path>,
        prefix: &'static str,
        magic: [u8; 4],
        max_record_size: u32,
    ) -> Result<Self, FlatFileError> {
        Self::open_with_limit(dir, prefix, magic, max_record_size, MAX_FLATFILE_SIZE)
    }

    pub fn open_with_limit(
        dir: impl AsRef<Path>,
        prefix: &'static str,
        magic: [u8; 4],
        max_record_size: u32,
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut store = Self {
            dir,
            prefix,
            magic,
            max_file_size,
            max_record_size,
            last_file: 0,
            last_len: 0,
        };
        // Resume after the highest existing file; its logical length is
        // the end of its last intact record.
        while store.path(store.last_file + 1).exists() {
            store.last_file += 1;
        }
        store.last_len = store.scan_logical_len(store.last_file)?;
        Ok(store)
    }

    fn path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("{}{:05}.dat", self.prefix, file))
    }

    fn scan_logical_len(&self, file: u32) -> Result<u64, FlatFileError> {
        let path = self.path(file);
        let mut handle = match File::open(&path) {
            Ok(handle) => handle,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut len = 0u64;
        let mut header = [0u8; 8];
        loop {
            handle.seek(SeekFrom::Start(len))?;
            match handle.read_exact(&mut header) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            if header[..4] != self.magic {
                break;
            }
            let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if size > self.max_record_size {
                break;
            }
            len += 8 + u64::from(size);
        }
        Ok(len)
    }

    pub fn append(&mut self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        if payload.len() as u64 > u64::from(self.max_record_size) {
            return Err(FlatFileError::Corrupt("record exceeds size bound"));
        }
        let record_len = 8 + payload.len() as u64;
        if self.last_len > 0 && self.last_len + record_len > self.max_file_size {
            self.last_file += 1;
            self.last_len = 0;
        }

        let path = self.path(self.last_file);
        let mut handle = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        // Preallocate in chunks so steady-state appends stay within the
        // already-reserved region.
        let needed = self.last_len + record_len;
        let allocated = handle.metadata()?.len();
        if needed > allocated {
            let target = needed.div_ceil(FLATFILE_CHUNK_SIZE) * FLATFILE_CHUNK_SIZE;
            handle.set_len(target.min(self.max_file_size.max(needed)))?;
        }

        let offset = self.last_len;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(&self.magic)?;
        handle.write_all(&(payload.len() as u32).to_le_bytes())?;
        handle.write_all(payload)?;

        self.last_len += record_len;
        Ok(FileLocation {
            file: self.last_file,
            offset,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        let mut handle = File::open(self.path(location.file))?;
        handle.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; 8];
        handle.read_exact(&mut header)?;
        if header[..4] != self.magic {
            return Err(FlatFileError::Corrupt("record magic mismatch"));
        }
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if size > self.max_record_size {
            return Err(FlatFileError::Corrupt("record size out of bounds"));
        }
        let mut payload = vec![0u8; size as usize];
        handle.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Syncs the file currently being appended to.
    pub fn flush(&mut self) -> Result<(), FlatFileError> {
        let path = self.path(self.last_file);
        match File::open(&path) {
            Ok(handle) => {
                handle.sync_all()?;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn last_file(&self) -> u32 {
        self.last_file
    }

    pub fn last_len(&self) -> u64 {
        self.last_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "kestrel-flatfiles-{tag}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn append_read_round_trip_and_reopen() {
        let dir = temp_dir("roundtrip");
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let mut store = FlatFileStore::open(&dir, "blk", magic, 1 << 20).expect("open");

        let a = store.append(b"first record").expect("append");
        let b = store.append(&[0xee; 300]).expect("append");
        assert_eq!(store.read(a).expect("read"), b"first record".to_vec());
        assert_eq!(store.read(b).expect("read"), vec![0xee; 300]);

        // Reopening resumes after the last intact record.
        let mut reopened = FlatFileStore::open(&dir, "blk", magic, 1 << 20).expect("reopen");
        assert_eq!(reopened.last_file(), 0);
        let c = reopened.append(b"third").expect("append");
        assert!(c.offset > b.offset);
        assert_eq!(reopened.read(a).expect("read"), b"first record".to_vec());
        assert_eq!(reopened.read(c).expect("read"), b"third".to_vec());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rolls_over_at_the_size_bound() {
        let dir = temp_dir("rollover");
        let mut store =
            FlatFileStore::open_with_limit(&dir, "blk", [1, 2, 3, 4], 1 << 16, 64).expect("open");

        let first = store.append(&[0xaa; 40]).expect("append");
        assert_eq!(first.file, 0);
        // 48 bytes used of 64; the next 28-byte record must roll over.
        let second = store.append(&[0xbb; 20]).expect("append");
        assert_eq!(second.file, 1);
        assert_eq!(second.offset, 0);
        assert_eq!(store.read(first).expect("read"), vec![0xaa; 40]);
        assert_eq!(store.read(second).expect("read"), vec![0xbb; 20]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_magic_detected() {
        let dir = temp_dir("magic");
        let mut store = FlatFileStore::open(&dir, "blk", [9, 9, 9, 9], 1 << 16).expect("open");
        let loc = store.append(b"payload").expect("append");
        let wrong = FlatFileStore::open(&dir, "blk", [8, 8, 8, 8], 1 << 16).expect("open");
        assert!(matches!(
            wrong.read(loc),
            Err(FlatFileError::Corrupt("record magic mismatch"))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
