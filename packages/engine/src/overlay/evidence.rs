// packages/engine/src/overlay/evidence.rs
//! Memory-mapped evidence snapshots

use crate::utils::config::EvidenceConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read-only view of one agent's evidence log
pub struct Snapshot {
    agent_id: String,
    data: SnapshotData,
}

enum SnapshotData {
    Mapped(Mmap),
    // zero-length files cannot be mapped
    Empty,
}

impl Snapshot {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            SnapshotData::Mapped(mmap) => &mmap[..],
            SnapshotData::Empty => &[],
        }
    }
}

impl Deref for Snapshot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Snapshot {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("agent_id", &self.agent_id)
            .field("len", &self.len())
            .finish()
    }
}

/// Loader for per-agent evidence files
#[derive(Debug, Clone)]
pub struct EvidenceOverlay {
    root: PathBuf,
    /// Without the leading dot, e.g. `merklelog.bin`
    extension: String,
}

impl EvidenceOverlay {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        let extension = extension.into();
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn from_config(config: &EvidenceConfig) -> Self {
        Self::new(config.root.clone(), config.extension.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the evidence file for `agent_id`
    pub fn path_for(&self, agent_id: &str) -> Result<PathBuf> {
        validate_agent_id(agent_id)?;
        Ok(self.root.join(format!("{}.{}", agent_id, self.extension)))
    }

    /// Map the whole evidence file read-only
    pub fn snapshot(&self, agent_id: &str) -> Result<Snapshot> {
        let (file, len) = self.open(agent_id)?;

        let data = if len == 0 {
            SnapshotData::Empty
        } else {
            // Safety: the map is read-only and evidence logs are immutable once written
            let mmap = unsafe {
                MmapOptions::new().map(&file).map_err(|e| {
                    EngineError::StorageFailed(format!(
                        "Failed to map evidence for {}: {}",
                        agent_id, e
                    ))
                })?
            };
            SnapshotData::Mapped(mmap)
        };

        debug!(agent_id, len, "Loaded evidence snapshot");
        Ok(Snapshot {
            agent_id: agent_id.to_string(),
            data,
        })
    }

    /// Copy at most `max_len` leading bytes of the evidence file
    pub fn snapshot_prefix(&self, agent_id: &str, max_len: usize) -> Result<Bytes> {
        let snapshot = self.snapshot(agent_id)?;
        let end = snapshot.len().min(max_len);
        Ok(Bytes::copy_from_slice(&snapshot[..end]))
    }

    /// Whether an evidence file exists for `agent_id`
    pub fn exists(&self, agent_id: &str) -> Result<bool> {
        let path = self.path_for(agent_id)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::StorageFailed(format!(
                "Failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Agent ids that have an evidence file, sorted
    ///
    /// A missing root directory means no evidence yet, not an error.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::StorageFailed(format!(
                    "Failed to read evidence root {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let suffix = format!(".{}", self.extension);
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let id = name.strip_suffix(&suffix)?;
                (!id.is_empty()).then(|| id.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn open(&self, agent_id: &str) -> Result<(File, u64)> {
        let path = self.path_for(agent_id)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => EngineError::EvidenceNotFound {
                agent_id: agent_id.to_string(),
            },
            _ => EngineError::StorageFailed(format!("Failed to open {}: {}", path.display(), e)),
        })?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::StorageFailed(format!("Failed to stat {}: {}", path.display(), e)))?
            .len();
        Ok((file, len))
    }
}

fn validate_agent_id(agent_id: &str) -> Result<()> {
    let bad = agent_id.is_empty()
        || agent_id.contains('/')
        || agent_id.contains('\\')
        || agent_id.contains("..")
        || agent_id.contains('\0');
    if bad {
        return Err(EngineError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(())
}
