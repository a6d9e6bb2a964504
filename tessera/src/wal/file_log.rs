//! File-backed transaction log
//!
//! File format:
//! ```text
//! +----------------+----------------+----------------+
//! | Header (8B)    | Frame 1        | Frame 2 ...    |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "TSLG"
//! - version: 2 bytes
//! - reserved: 2 bytes
//!
//! Frame:
//! - payload_len: 4 bytes
//! - payload: variable (bincode serialized LogEntry)
//! - crc32: 4 bytes
//! ```
//!
//! A frame cut short at the end of the file is a torn append from a crash;
//! loading cuts it off so later appends follow the last whole frame. A
//! checksum mismatch anywhere is corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use super::{Checkpoint, LogEntry, TransactionDelta, TransactionLog};
use crate::{Result, TesseraError};

/// Log magic bytes
const LOG_MAGIC: &[u8; 4] = b"TSLG";
/// Log format version
const LOG_VERSION: u16 = 1;
/// Header size
const LOG_HEADER_SIZE: usize = 8;
/// Buffer size for appends
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    sync: bool,
}

impl FileLog {
    /// Open (creating if needed) the log file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        if !path.exists() {
            Self::write_file(&path, &[])?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(None),
            sync: true,
        })
    }

    /// fsync after every append (default `true`)
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header() -> [u8; LOG_HEADER_SIZE] {
        let mut buf = [0u8; LOG_HEADER_SIZE];
        buf[0..4].copy_from_slice(LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
        buf
    }

    fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
        let payload = bincode::serialize(entry)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.write_all(&payload)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
        Ok(frame)
    }

    /// Atomically replace the file with a header followed by `entries`
    fn write_file(path: &Path, entries: &[LogEntry]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp)?,
            );
            file.write_all(&Self::header())?;
            for entry in entries {
                file.write_all(&Self::encode_frame(entry)?)?;
            }
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Entries of `raw` and the length of its whole frames
    fn decode(raw: &[u8]) -> Result<(Vec<LogEntry>, usize)> {
        if raw.len() < LOG_HEADER_SIZE || &raw[0..4] != LOG_MAGIC {
            return Err(TesseraError::Corrupt("log file has no valid header".to_string()));
        }
        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version != LOG_VERSION {
            return Err(TesseraError::Corrupt(format!(
                "log format version {}, expected {}",
                version, LOG_VERSION
            )));
        }

        let mut entries = Vec::new();
        let mut pos = LOG_HEADER_SIZE;
        while pos < raw.len() {
            if raw.len() - pos < 4 {
                log::warn!("ignoring torn frame header at offset {}", pos);
                break;
            }
            let len = Cursor::new(&raw[pos..pos + 4]).read_u32::<LittleEndian>()? as usize;
            let end = pos + 4 + len + 4;
            if end > raw.len() {
                log::warn!("ignoring torn frame at offset {}", pos);
                break;
            }
            let payload = &raw[pos + 4..pos + 4 + len];
            let crc = Cursor::new(&raw[end - 4..end]).read_u32::<LittleEndian>()?;
            if crc32fast::hash(payload) != crc {
                return Err(TesseraError::Corrupt(format!(
                    "log frame at offset {} fails its checksum",
                    pos
                )));
            }
            entries.push(bincode::deserialize(payload)?);
            pos = end;
        }
        Ok((entries, pos))
    }
}

impl TransactionLog for FileLog {
    fn load(&self) -> Result<Vec<LogEntry>> {
        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;
        let (entries, valid) = Self::decode(&raw)?;
        if valid < raw.len() {
            // drop the open handle, it may sit past the cut
            let mut guard = self.writer.lock();
            *guard = None;
            OpenOptions::new().write(true).open(&self.path)?.set_len(valid as u64)?;
        }
        log::debug!("loaded {} log entries from {}", entries.len(), self.path.display());
        Ok(entries)
    }

    fn append(&self, delta: &TransactionDelta) -> Result<()> {
        let frame = Self::encode_frame(&LogEntry::Delta(delta.clone()))?;
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let file = OpenOptions::new().append(true).open(&self.path)?;
            *guard = Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file));
        }
        if let Some(writer) = guard.as_mut() {
            writer.write_all(&frame)?;
            writer.flush()?;
            if self.sync {
                writer.get_ref().sync_data()?;
            }
        }
        Ok(())
    }

    fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self.writer.lock();
        // the open handle points at the file being replaced
        *guard = None;
        Self::write_file(&self.path, &[LogEntry::Checkpoint(checkpoint.clone())])?;
        log::debug!(
            "checkpointed {} tables into {}",
            checkpoint.tables.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::wal::TableRows;
    use chrono::Utc;
    use tempfile::tempdir;

    fn delta(rid: u64) -> TransactionDelta {
        TransactionDelta {
            txn_id: rid,
            committed_at: Utc::now(),
            tables: vec![TableRows {
                table: "t".to_string(),
                rows: vec![(rid, vec![Value::from("x"), Value::Null])],
            }],
            tombstones: Vec::new(),
        }
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = FileLog::open(&path).unwrap().with_sync(false);
        log.append(&delta(1)).unwrap();
        log.append(&delta(2)).unwrap();

        let reopened = FileLog::open(&path).unwrap();
        let entries = reopened.load().unwrap();
        let ids: Vec<_> = entries.iter().map(|e| delta_like(e).txn_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(delta_like(&entries[0]).tables, delta(1).tables);
    }

    fn delta_like(entry: &LogEntry) -> TransactionDelta {
        match entry {
            LogEntry::Delta(d) => d.clone(),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_rewrites_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = FileLog::open(&path).unwrap();
        log.append(&delta(1)).unwrap();
        log.checkpoint(&Checkpoint {
            taken_at: Utc::now(),
            next_record_id: 2,
            tables: Vec::new(),
        })
        .unwrap();
        log.append(&delta(2)).unwrap();

        let entries = log.load().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(&entries[0], LogEntry::Checkpoint(c) if c.next_record_id == 2));
    }

    #[test]
    fn test_torn_tail_is_ignored_and_bad_crc_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.log");
        let log = FileLog::open(&path).unwrap();
        log.append(&delta(1)).unwrap();
        log.append(&delta(2)).unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 3]).unwrap();
        let torn = FileLog::open(&path).unwrap();
        assert_eq!(torn.load().unwrap().len(), 1);
        torn.append(&delta(3)).unwrap();
        let ids: Vec<_> = torn.load().unwrap().iter().map(|e| delta_like(e).txn_id).collect();
        assert_eq!(ids, vec![1, 3]);

        let mut raw = raw;
        raw[LOG_HEADER_SIZE + 6] ^= 0xff;
        fs::write(&path, &raw).unwrap();
        assert!(matches!(
            FileLog::open(&path).unwrap().load(),
            Err(TesseraError::Corrupt(_))
        ));
    }
}
