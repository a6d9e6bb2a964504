//! File-backed block store
//!
//! One file per block under a directory:
//!
//! ```text
//! <dir>/<block id, 16 hex digits>.blk
//!
//! +-----------+-----------+--------------+-----------+-----------+
//! | magic 4B  | version 2B| length u32 LE| crc32 4B  | payload   |
//! | "TSBK"    |           |              |           |           |
//! +-----------+-----------+--------------+-----------+-----------+
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::BlockStore;
use crate::{BlockId, Result, TesseraError};

const BLOCK_MAGIC: &[u8; 4] = b"TSBK";
const BLOCK_FORMAT_VERSION: u16 = 1;
const BLOCK_HEADER_SIZE: usize = 14;
const BLOCK_EXTENSION: &str = "blk";

#[derive(Debug)]
pub struct FileBlockStore {
    dir: PathBuf,
    count: AtomicUsize,
    bytes_read: AtomicU64,
    sync_writes: bool,
}

impl FileBlockStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut count = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(BLOCK_EXTENSION) {
                count += 1;
            }
        }
        log::debug!("opened block store at {} with {} blocks", dir.display(), count);
        Ok(Self {
            dir,
            count: AtomicUsize::new(count),
            bytes_read: AtomicU64::new(0),
            sync_writes: false,
        })
    }

    /// fsync every block file after writing it
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: BlockId) -> PathBuf {
        self.dir.join(format!("{:016x}.{}", id, BLOCK_EXTENSION))
    }

    fn encode_header(bytes: &[u8]) -> io::Result<Vec<u8>> {
        let mut header = Vec::with_capacity(BLOCK_HEADER_SIZE);
        header.write_all(BLOCK_MAGIC)?;
        header.write_u16::<LittleEndian>(BLOCK_FORMAT_VERSION)?;
        header.write_u32::<LittleEndian>(bytes.len() as u32)?;
        header.write_u32::<LittleEndian>(crc32fast::hash(bytes))?;
        Ok(header)
    }

    fn decode(id: BlockId, raw: &[u8]) -> Result<Arc<[u8]>> {
        if raw.len() < BLOCK_HEADER_SIZE || &raw[0..4] != BLOCK_MAGIC {
            return Err(TesseraError::Corrupt(format!("block {} has no valid header", id)));
        }
        let mut cursor = Cursor::new(&raw[4..BLOCK_HEADER_SIZE]);
        let version = cursor.read_u16::<LittleEndian>()?;
        let len = cursor.read_u32::<LittleEndian>()? as usize;
        let crc = cursor.read_u32::<LittleEndian>()?;
        if version != BLOCK_FORMAT_VERSION {
            return Err(TesseraError::Corrupt(format!(
                "block {} has format version {}, expected {}",
                id, version, BLOCK_FORMAT_VERSION
            )));
        }
        let payload = &raw[BLOCK_HEADER_SIZE..];
        if payload.len() != len {
            return Err(TesseraError::Corrupt(format!(
                "block {} truncated: {} of {} bytes",
                id,
                payload.len(),
                len
            )));
        }
        if crc32fast::hash(payload) != crc {
            return Err(TesseraError::Corrupt(format!("block {} checksum mismatch", id)));
        }
        Ok(Arc::from(payload))
    }
}

impl BlockStore for FileBlockStore {
    fn write(&self, id: BlockId, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(id);
        let existed = path.exists();
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&Self::encode_header(bytes)?)?;
            file.write_all(bytes)?;
            if self.sync_writes {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;
        if !existed {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read(&self, id: BlockId) -> Result<Arc<[u8]>> {
        let mut raw = Vec::new();
        File::open(self.path_of(id))?.read_to_end(&mut raw)?;
        self.bytes_read.fetch_add(raw.len() as u64, Ordering::Relaxed);
        Self::decode(id, &raw)
    }

    fn remove(&self, id: BlockId) -> Result<()> {
        match fs::remove_file(self.path_of(id)) {
            Ok(()) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, id: BlockId) -> bool {
        self.path_of(id).exists()
    }

    fn block_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}
