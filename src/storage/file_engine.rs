use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::engine::Engine;
use crate::storage::file_lock::FileLock;
use crate::storage::log::{DataLog, LogOp, SyncMode};

pub const DATA_LOG_NAME: &str = "data.log";

/// Directory-backed engine: an ordered map rebuilt from an append-only log.
///
/// Writes outside a transaction are logged one frame each. Writes inside a
/// transaction stay in an overlay until `commit` logs them as one frame, so a
/// crash mid-transaction leaves nothing of it behind.
pub struct FileEngine {
    dir: PathBuf,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    overlay: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    log: DataLog,
    /// Logged operations superseded by later ones.
    obsolete: usize,
    closed: bool,
    _lock: FileLock,
}

impl FileEngine {
    pub fn open_with(dir: &Path, sync_mode: SyncMode) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let lock = FileLock::acquire(dir)?;
        let mut log = DataLog::open(&dir.join(DATA_LOG_NAME), sync_mode)?;

        let mut map = BTreeMap::new();
        let mut obsolete = 0;
        let entries = log.read_entries()?;
        let frames = entries.len();
        for entry in entries {
            for op in entry.ops {
                obsolete += Self::apply(&mut map, op);
            }
        }
        info!(dir = %dir.display(), frames, keys = map.len(), "Opened file engine");

        Ok(FileEngine {
            dir: dir.to_path_buf(),
            map,
            overlay: None,
            log,
            obsolete,
            closed: false,
            _lock: lock,
        })
    }

    /// Apply one logged operation, returning how many logged operations it made obsolete.
    fn apply(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: LogOp) -> usize {
        match op {
            LogOp::Put { key, value } => map.insert(key, value).map_or(0, |_| 1),
            LogOp::Delete { key } => map.remove(&key).map_or(1, |_| 2),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Rewrite the log so it holds only live keys.
    pub fn compact(&mut self) -> Result<()> {
        self.check_open()?;
        let ops = self
            .map
            .iter()
            .map(|(key, value)| LogOp::Put { key: key.clone(), value: value.clone() })
            .collect();
        self.log.rewrite(ops)?;
        self.obsolete = 0;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::new(
                ErrorKind::InvalidState,
                format!("File engine at {} is closed", self.dir.display()),
            ));
        }
        Ok(())
    }

    fn write(&mut self, op: LogOp) -> Result<()> {
        self.check_open()?;
        if let Some(overlay) = self.overlay.as_mut() {
            match op {
                LogOp::Put { key, value } => overlay.insert(key, Some(value)),
                LogOp::Delete { key } => overlay.insert(key, None),
            };
            return Ok(());
        }
        self.log.append(vec![op.clone()], false)?;
        self.obsolete += Self::apply(&mut self.map, op);
        Ok(())
    }
}

impl Engine for FileEngine {
    fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(dir) => FileEngine::open_with(dir, SyncMode::OnCommit),
            None => Err(Error::new(
                ErrorKind::InvalidArgument,
                "File engine cannot open a memory-only database".to_string(),
            )),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.overlay = None;
        self.log.sync()?;
        if self.obsolete > self.map.len() {
            self.compact()?;
        }
        self.closed = true;
        debug!(dir = %self.dir.display(), "Closed file engine");
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(pending) = self.overlay.as_ref().and_then(|o| o.get(key)) {
            return Ok(pending.clone());
        }
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(LogOp::Put { key: key.to_vec(), value: value.to_vec() })
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.write(LogOp::Delete { key: key.to_vec() })
    }

    fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.overlay.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "File engine transaction already active".to_string(),
            ));
        }
        self.overlay = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        let Some(overlay) = self.overlay.take() else {
            return Ok(());
        };
        let ops: Vec<LogOp> = overlay
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => LogOp::Put { key, value },
                None => LogOp::Delete { key },
            })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.log.append(ops.clone(), true)?;
        for op in ops {
            self.obsolete += Self::apply(&mut self.map, op);
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.overlay = None;
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }
}
