// packages/engine/src/registry/loader.rs
//! Descriptor directory loader
//!
//! One record per file; `.yaml`/`.yml` and `.json` are recognized, other
//! files are skipped. Files are read in name order so repeated loads
//! register agents in the same order.

use crate::registry::descriptor::AgentDescriptor;
use crate::utils::errors::{EngineError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
enum RecordFormat {
    Yaml,
    Json,
}

impl RecordFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(RecordFormat::Yaml),
            "json" => Some(RecordFormat::Json),
            _ => None,
        }
    }
}

/// Read and validate every descriptor record in `dir`
pub fn load_descriptor_dir(dir: &Path) -> Result<Vec<(PathBuf, AgentDescriptor)>> {
    let load_error = |path: &Path, reason: String| EngineError::DescriptorLoad {
        path: path.to_path_buf(),
        reason,
    };

    let entries = fs::read_dir(dir).map_err(|e| load_error(dir, e.to_string()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| load_error(dir, e.to_string()))?;
        let path = entry.path();
        if path.is_file() && RecordFormat::from_path(&path).is_some() {
            paths.push(path);
        } else {
            debug!("Skipping non-descriptor entry {:?}", path);
        }
    }
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let descriptor = parse_record(&path).map_err(|reason| load_error(&path, reason))?;
        descriptor
            .validate()
            .map_err(|e| load_error(&path, e.to_string()))?;

        if records
            .iter()
            .any(|(_, existing): &(PathBuf, AgentDescriptor)| existing.id == descriptor.id)
        {
            warn!(
                "Descriptor '{}' in {:?} overrides an earlier record",
                descriptor.id, path
            );
        }
        records.push((path, descriptor));
    }

    Ok(records)
}

fn parse_record(path: &Path) -> std::result::Result<AgentDescriptor, String> {
    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    match RecordFormat::from_path(path) {
        Some(RecordFormat::Yaml) => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
        Some(RecordFormat::Json) => serde_json::from_str(&contents).map_err(|e| e.to_string()),
        None => Err("unrecognized descriptor format".to_string()),
    }
}
