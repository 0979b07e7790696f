use std::path::Path;

use anyhow::{Context, Result};
use synthloop::flags::read_flags;

/// Print the effective loop flags: the script's assignments with environment
/// overrides applied.
pub fn run(synth_file: &Path, pretty: bool) -> Result<()> {
    let flags = read_flags(synth_file)
        .with_context(|| format!("Failed to read {:?}", synth_file))?
        .with_overrides(|name| std::env::var(name).ok());

    let json = if pretty {
        serde_json::to_string_pretty(&flags)?
    } else {
        serde_json::to_string(&flags)?
    };
    println!("{}", json);
    Ok(())
}
