//! Regenerate client libraries and attribute every change in the generated
//! output to the upstream source version that caused it.
//!
//! The crate is organized around a [`Toolbox`], which owns the flattened,
//! time-ordered history of every source and memoizes one generator run per
//! global version index. [`synthesize_loop`] drives a binary search over that
//! history, patch-merging each attributable change into the destination branch
//! as its own commit.
//!
//! External collaborators are expressed as traits:
//!
//! - [`SourceVersion`]: one revision of one upstream source
//! - [`Synthesizer`]: one invocation of the code generator
//! - [`VersionControl`]: branch, commit, diff and patch operations
//! - [`ChangePusher`] / [`PullRequest`]: publishing the resulting branch
//!
//! The generator is assumed to be deterministic: two runs against the same
//! snapshot must produce the same tree, otherwise the search may attribute a
//! change to the wrong version.

mod error;
pub mod flags;
pub mod flatten;
pub mod metadata;
pub mod pusher;
pub mod synth;
pub mod synthesizer;
pub mod toolbox;
pub mod vcs;
pub mod version;

pub use error::{Error, Result};
pub use flags::LoopFlags;
pub use flatten::{ApplyTable, FlatVersion, flatten_and_sort_source_versions, generate_apply_table};
pub use metadata::Metadata;
pub use pusher::{ChangePusher, Context, LoggingChangePusher, PullRequest, SquashingChangePusher};
pub use synth::{LoopOutcome, synthesize_loop};
pub use synthesizer::{ProcessSynthesizer, SynthError, Synthesizer};
pub use toolbox::{Outcome, Toolbox, ToolboxSettings};
pub use vcs::{IgnoreRules, Patch, VcsError, VersionControl};
pub use version::{Preconfig, SourceVersion};
