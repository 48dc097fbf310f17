//! File-backed persistence for the `--database` option.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lightvm_host::{BridgeError, DatabaseSave, DatabaseSink, Result};
use serde_json::Value as JsonValue;

/// Keeps the `chain` field of the latest save in a single file.
///
/// Each save replaces the file atomically, so a crash mid-write leaves the
/// previous content in place.
#[derive(Debug, Clone)]
pub struct FileDatabase {
    path: PathBuf,
}

impl FileDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content to hand back to the VM at startup, if any was saved.
    pub fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BridgeError::Config(format!(
                "failed to read database {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write(&self, content: &str) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let persistence = |e: std::io::Error| {
            BridgeError::Persistence(format!("{}: {}", self.path.display(), e))
        };

        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(persistence)?;
        file.write_all(content.as_bytes()).map_err(persistence)?;
        file.as_file().sync_all().map_err(persistence)?;
        file.persist(&self.path).map_err(|e| persistence(e.error))?;
        Ok(())
    }
}

/// A string chain value is stored as-is; anything else as JSON text.
fn chain_content(chain: &JsonValue) -> String {
    match chain {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DatabaseSink for FileDatabase {
    async fn save(&self, payload: DatabaseSave) -> Result<()> {
        let content = chain_content(&payload.chain);
        let database = self.clone();
        tokio::task::spawn_blocking(move || database.write(&content))
            .await
            .map_err(|e| BridgeError::Internal(format!("database writer failed: {}", e)))?
    }
}
