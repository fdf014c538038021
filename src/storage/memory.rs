use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::engine::Engine;

type Store = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory engine. Clones share one store, so a database can be closed and
/// reopened on the same data, and tests can inspect what was written.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    store: Arc<Mutex<Store>>,
    /// Prior values of keys written in the open transaction, oldest first.
    undo: Option<Vec<(Vec<u8>, Option<Vec<u8>>)>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    /// Snapshot of every key, in order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.store.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    fn remember(&mut self, key: &[u8], previous: Option<Vec<u8>>) {
        if let Some(undo) = self.undo.as_mut() {
            undo.push((key.to_vec(), previous));
        }
    }
}

impl Engine for MemoryEngine {
    fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            None => Ok(MemoryEngine::new()),
            Some(p) => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("Memory engine cannot be opened at {}", p.display()),
            )),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.store.lock().get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let previous = self.store.lock().insert(key.to_vec(), value.to_vec());
        self.remember(key, previous);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let previous = self.store.lock().remove(key);
        if previous.is_some() {
            self.remember(key, previous);
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.undo.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "Memory engine transaction already active".to_string(),
            ));
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.undo = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(undo) = self.undo.take() {
            let mut store = self.store.lock();
            for (key, previous) in undo.into_iter().rev() {
                match previous {
                    Some(value) => store.insert(key, value),
                    None => store.remove(&key),
                };
            }
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }
}
