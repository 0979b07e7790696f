use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use synthloop::{Metadata, SourceVersion, flatten_and_sort_source_versions};

#[derive(Debug, Serialize)]
struct VersionEntry {
    index: usize,
    source: String,
    description: String,
    timestamp: DateTime<Utc>,
    subject: String,
}

pub fn run(metadata_path: &Path, no_self: bool, pretty: bool) -> Result<()> {
    let metadata = Metadata::load(metadata_path)
        .with_context(|| format!("Failed to read {:?}", metadata_path))?
        .unwrap_or_default();

    let clone_dir = tempfile::tempdir()?;
    let mut groups: Vec<Vec<Rc<dyn SourceVersion>>> = Vec::new();
    if !no_self {
        groups.push(synthloop_git::enumerate_versions_for_working_repo(metadata_path)?);
    }
    groups.extend(synthloop_git::enumerate_versions(&metadata, clone_dir.path())?);

    let entries: Vec<VersionEntry> = flatten_and_sort_source_versions(&groups)
        .iter()
        .enumerate()
        .map(|(index, flat)| {
            let comment = flat.version.comment();
            VersionEntry {
                index,
                source: flat.version.source_name(),
                description: flat.version.source_description(),
                timestamp: flat.version.timestamp(),
                subject: comment.lines().next().unwrap_or_default().to_string(),
            }
        })
        .collect();

    let json = if pretty {
        serde_json::to_string_pretty(&entries)?
    } else {
        serde_json::to_string(&entries)?
    };
    println!("{}", json);
    Ok(())
}
