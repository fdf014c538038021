use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::core::error::{Error, ErrorKind, Result};

/// Largest frame accepted on replay.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;
const FRAME_HEADER_LEN: u64 = 8;

/// Append-only log backing the file engine
pub struct DataLog {
    pub file: File,
    pub path: PathBuf,
    pub position: u64,
    pub sync_mode: SyncMode,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Immediate, // fsync after every frame
    OnCommit,  // fsync after transaction frames only
    None,      // Let OS handle it
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub ops: Vec<LogOp>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl DataLog {
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Ok(DataLog {
            file,
            path: path.to_path_buf(),
            position: 0,
            sync_mode,
            sequence: 0,
        })
    }

    /// Append one frame: len | crc32 | bincode(entry).
    /// `transactional` marks a committed transaction for `SyncMode::OnCommit`.
    pub fn append(&mut self, ops: Vec<LogOp>, transactional: bool) -> Result<()> {
        let entry = LogEntry {
            sequence: self.sequence,
            ops,
            timestamp: Utc::now(),
        };

        let data = bincode::serialize(&entry)?;
        let len = data.len() as u32;
        let checksum = crc32fast::hash(&data);

        let mut frame = Vec::with_capacity(data.len() + FRAME_HEADER_LEN as usize);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&data);
        self.file.write_all(&frame)?;

        self.sequence += 1;
        self.position += frame.len() as u64;

        match self.sync_mode {
            SyncMode::Immediate => self.file.sync_all()?,
            SyncMode::OnCommit if transactional => self.file.sync_all()?,
            _ => {}
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read every intact frame. A short or checksum-failing frame ends the
    /// replay and the log is truncated there.
    pub fn read_entries(&mut self) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let end = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut good: u64 = 0;

        loop {
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            match self.file.read_exact(&mut header) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::new(ErrorKind::Io, format!("Failed to read log: {}", e))),
            }

            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let checksum = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len > MAX_FRAME_LEN || good + FRAME_HEADER_LEN + len as u64 > end {
                break;
            }

            let mut data = vec![0u8; len];
            self.file.read_exact(&mut data)?;
            if crc32fast::hash(&data) != checksum {
                break;
            }

            let entry: LogEntry = bincode::deserialize(&data)?;
            self.sequence = entry.sequence + 1;
            entries.push(entry);
            good += FRAME_HEADER_LEN + len as u64;
        }

        if good < end {
            warn!(
                path = %self.path.display(),
                discarded = end - good,
                "Truncating torn tail of data log"
            );
            self.file.set_len(good)?;
        }

        self.position = self.file.seek(SeekFrom::End(0))?;
        Ok(entries)
    }

    /// Replace the log with a single frame holding `ops`.
    pub fn rewrite(&mut self, ops: Vec<LogOp>) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = DataLog::open(&tmp_path, SyncMode::Immediate)?;
            tmp.file.set_len(0)?;
            tmp.sequence = self.sequence;
            tmp.append(ops, true)?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let sequence = self.sequence + 1;
        *self = DataLog::open(&self.path, self.sync_mode)?;
        self.sequence = sequence;
        self.position = self.file.seek(SeekFrom::End(0))?;
        debug!(path = %self.path.display(), bytes = self.position, "Compacted data log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.log");
        {
            let mut log = DataLog::open(&path, SyncMode::OnCommit).unwrap();
            log.append(vec![LogOp::Put { key: b"a".to_vec(), value: b"1".to_vec() }], false).unwrap();
            log.append(vec![LogOp::Delete { key: b"a".to_vec() }], true).unwrap();
        }
        let mut log = DataLog::open(&path, SyncMode::OnCommit).unwrap();
        let entries = log.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.sequence, 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.log");
        let intact_len;
        {
            let mut log = DataLog::open(&path, SyncMode::None).unwrap();
            log.append(vec![LogOp::Put { key: b"a".to_vec(), value: b"1".to_vec() }], false).unwrap();
            intact_len = log.position;
            log.append(vec![LogOp::Put { key: b"b".to_vec(), value: b"2".to_vec() }], false).unwrap();
        }
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 3]).unwrap();

        let mut log = DataLog::open(&path, SyncMode::None).unwrap();
        assert_eq!(log.read_entries().unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
    }
}
