use std::path::Path;
use crate::core::error::Result;

/// Capabilities the segment and index layers need from a storage backend.
///
/// Engines without transactions keep the default no-op `begin`, `commit` and
/// `rollback` so database code is the same for every backend. Errors from the
/// backend are returned as `ErrorKind::Io` and never retried here.
pub trait Engine {
    /// Open the engine at `path`, or in memory when `path` is `None`.
    /// Engines that cannot honour one of the two must return an error.
    fn open(path: Option<&Path>) -> Result<Self>
    where
        Self: Sized;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        false
    }
}
