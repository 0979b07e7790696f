use chrono::{DateTime, Utc};

use crate::Result;

/// Configuration handed to the generator for one run.
///
/// Each applied [`SourceVersion`] records where the generator should find its
/// source (for example, a map from remote URL to a local clone).
pub type Preconfig = serde_json::Map<String, serde_json::Value>;

/// One historical revision of one upstream source.
///
/// Versions of the same source form a strictly time-ordered sequence, oldest
/// first. Identity is positional: two versions are the same version only if
/// they sit at the same index of the same source's sequence.
pub trait SourceVersion {
    /// Point `preconfig` at this version.
    ///
    /// May also change the local file system, e.g. check out a specific commit
    /// of a cloned source repository.
    fn apply(&self, preconfig: &mut Preconfig) -> Result<()>;

    /// When the revision was made upstream.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Commit message to use when this version is the cause of a change.
    fn comment(&self) -> String;

    /// Name of the source. Used in branch names, so it must be a valid git
    /// ref component.
    fn source_name(&self) -> String;

    /// Human-readable description of the source, e.g. `Git repo https://...`.
    fn source_description(&self) -> String;
}
