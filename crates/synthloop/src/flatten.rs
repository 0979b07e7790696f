//! Interleave the histories of several sources into one timeline.

use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};

use crate::version::SourceVersion;

/// For every global index, the index of the version of each group that is in
/// effect at that point in time, keyed by group number.
pub type ApplyTable = Vec<BTreeMap<usize, usize>>;

/// A version tagged with the group (source) it came from.
///
/// `merged`, `branch_has_changes` and `generation_failed` are owned by the
/// [`Toolbox`](crate::Toolbox) and are each written at most once.
pub struct FlatVersion {
    pub group_number: usize,
    pub version: Rc<dyn SourceVersion>,
    pub sort_key: (DateTime<Utc>, usize),
    pub merged: bool,
    /// Set after code has been generated for this version.
    pub branch_has_changes: Option<bool>,
    /// The generator failed for this version. Its branch is never merged.
    pub generation_failed: bool,
}

impl FlatVersion {
    pub fn new(group_number: usize, version: Rc<dyn SourceVersion>) -> Self {
        let sort_key = (version.timestamp(), group_number);
        FlatVersion {
            group_number,
            version,
            sort_key,
            merged: false,
            branch_has_changes: None,
            generation_failed: false,
        }
    }
}

impl std::fmt::Debug for FlatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatVersion")
            .field("group_number", &self.group_number)
            .field("source", &self.version.source_name())
            .field("sort_key", &self.sort_key)
            .field("merged", &self.merged)
            .field("branch_has_changes", &self.branch_has_changes)
            .field("generation_failed", &self.generation_failed)
            .finish()
    }
}

/// Flatten groups of versions into one list sorted by `(timestamp, group)`.
///
/// For the input `[[a, b], [c, d, e]]` the result holds `(0, a), (0, b),
/// (1, c), (1, d), (1, e)` ordered by timestamp. Ties are broken by group
/// number so the order is reproducible when clocks collide.
pub fn flatten_and_sort_source_versions(
    source_versions: &[Vec<Rc<dyn SourceVersion>>],
) -> Vec<FlatVersion> {
    let mut flat: Vec<FlatVersion> = source_versions
        .iter()
        .enumerate()
        .flat_map(|(number, group)| {
            group
                .iter()
                .map(move |version| FlatVersion::new(number, Rc::clone(version)))
        })
        .collect();
    flat.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
    flat
}

/// Answer "when applying version `i`, which versions of the other sources
/// must be applied too?" for every `i`.
///
/// The answer is the youngest version of each other source that is not
/// younger than `i`; when every version of a source is younger, its oldest
/// version. For two sources with versions at these times:
///
/// ```text
/// A: 0   2  3  4
/// B:   1         5
/// ```
///
/// the table is `[{A:0,B:1}, {A:0,B:1}, {A:2,B:1}, {A:3,B:1}, {A:4,B:1}, {A:4,B:5}]`.
/// One forward and one backward pass, O(n·k) for k sources.
pub fn generate_apply_table(versions: &[FlatVersion]) -> ApplyTable {
    let mut table: ApplyTable = Vec::with_capacity(versions.len());
    let mut seen: BTreeMap<usize, usize> = BTreeMap::new();
    for (i, version) in versions.iter().enumerate() {
        seen.insert(version.group_number, i);
        table.push(seen.clone());
    }

    // Fill in groups that have not started yet with their oldest version.
    let Some(mut next) = table.last().cloned() else {
        return table;
    };
    for row in table.iter_mut().rev().skip(1) {
        for (&group, &index) in &next {
            row.entry(group).or_insert(index);
        }
        next = row.clone();
    }
    table
}
