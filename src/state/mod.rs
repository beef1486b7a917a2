//! Failure-state persistence
//!
//! When a master failure is confirmed, its last observed binlog GTID position
//! is written out for post-mortem use. The write is advisory: errors go back
//! to the caller, which logs and carries on.

use std::io;
use std::path::{Path, PathBuf};

use crate::gtid::GtidList;

/// Well-known file holding the failing master's binlog position
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the file with the position in textual GTID-list form.
    pub async fn write_position(&self, position: &GtidList) -> io::Result<()> {
        tokio::fs::write(&self.path, position.to_string()).await
    }

    /// Read back the persisted position, if any.
    pub async fn read_position(&self) -> io::Result<GtidList> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        GtidList::parse(content.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}
