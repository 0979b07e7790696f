//! The generator's metadata file (`synth.metadata`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_METADATA_FILE: &str = "synth.metadata";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub sources: Vec<MetadataSource>,

    /// Files the generator produced. Present only when obsolete-file tracking
    /// is turned on.
    #[serde(default, rename = "generatedFiles")]
    pub generated_files: Vec<String>,
}

/// One entry of `sources`. Only git sources drive version enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSourceEntry {
    pub name: String,
    pub remote: String,
    /// Absent for the repository's own entry (`name: "."`).
    #[serde(default)]
    pub sha: String,
}

impl Metadata {
    /// Parse metadata. An empty JSON object yields `None`.
    pub fn parse(bytes: &[u8]) -> Result<Option<Metadata>> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if value.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    /// Load metadata from disk. A missing or empty file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Metadata>> {
        match fs::read(path) {
            Ok(bytes) => Self::parse(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains_generated_files(&self) -> bool {
        !self.generated_files.is_empty()
    }

    /// Git sources, deduplicated by `(name, remote)` in order of appearance.
    pub fn git_sources(&self) -> Vec<&GitSourceEntry> {
        let mut seen = std::collections::HashSet::new();
        self.sources
            .iter()
            .filter_map(|s| s.git.as_ref())
            .filter(|g| seen.insert((g.name.as_str(), g.remote.as_str())))
            .collect()
    }
}
