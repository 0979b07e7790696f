//! Invoking the external code generator.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::version::Preconfig;

/// Environment variable through which the generator process learns where its
/// preconfig file lives. Set on the child process only.
pub const PRECONFIG_ENV: &str = "SYNTHTOOL_PRECONFIG_FILE";

#[derive(Debug, Error)]
pub enum SynthError {
    /// The generator ran and exited nonzero.
    #[error("generator exited with status {code:?}")]
    GeneratorFailed { code: Option<i32>, log: String },

    #[error("failed to run generator: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write preconfig: {0}")]
    Json(#[from] serde_json::Error),
}

/// One invocation of the code generator against the current working tree.
pub trait Synthesizer {
    /// Run the generator with `preconfig`, writing its log to `log_path`.
    /// Returns the log text.
    fn synthesize(&self, log_path: &Path, preconfig: &Preconfig) -> Result<String, SynthError>;

    /// Like [`synthesize`](Self::synthesize), but a generator failure yields
    /// `Ok(None)` instead of an error. Errors that are not the generator's own
    /// failure (e.g. it could not be launched) still propagate.
    fn synthesize_and_catch_failure(
        &self,
        log_path: &Path,
        preconfig: &Preconfig,
    ) -> Result<Option<String>, SynthError> {
        match self.synthesize(log_path, preconfig) {
            Ok(log) => Ok(Some(log)),
            Err(SynthError::GeneratorFailed { code, .. }) => {
                debug!(?code, "generator failed; treating as no change");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Runs the generator as a child process in a fixed directory.
#[derive(Debug, Clone)]
pub struct ProcessSynthesizer {
    /// Program and leading arguments, e.g. `["python3", "-m", "synthtool"]`.
    pub command: Vec<String>,
    pub metadata_path: PathBuf,
    pub synth_file: PathBuf,
    /// Passed through after `--`.
    pub extra_args: Vec<String>,
    /// Directory the generator runs in.
    pub working_dir: PathBuf,
    /// Where the preconfig is written before each run.
    pub preconfig_path: PathBuf,
}

impl ProcessSynthesizer {
    pub fn new(
        command: Vec<String>,
        metadata_path: impl Into<PathBuf>,
        synth_file: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        preconfig_path: impl Into<PathBuf>,
    ) -> Self {
        ProcessSynthesizer {
            command,
            metadata_path: metadata_path.into(),
            synth_file: synth_file.into(),
            extra_args: Vec::new(),
            working_dir: working_dir.into(),
            preconfig_path: preconfig_path.into(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push("--metadata".to_string());
        argv.push(self.metadata_path.to_string_lossy().to_string());
        argv.push(self.synth_file.to_string_lossy().to_string());
        argv.push("--".to_string());
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

impl Synthesizer for ProcessSynthesizer {
    fn synthesize(&self, log_path: &Path, preconfig: &Preconfig) -> Result<String, SynthError> {
        fs::write(&self.preconfig_path, serde_json::to_vec(preconfig)?)?;

        let argv = self.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(SynthError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty generator command",
            )));
        };
        info!(command = %argv.join(" "), "running generator");
        debug!(log_path = %log_path.display(), "generator log");

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log_file = File::create(log_path)?;
        let status = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .env(PRECONFIG_ENV, &self.preconfig_path)
            .stdin(Stdio::null())
            .stdout(log_file.try_clone()?)
            .stderr(log_file)
            .status()?;

        let log = String::from_utf8_lossy(&fs::read(log_path)?).into_owned();
        if !status.success() {
            error!(code = ?status.code(), "generator failed");
            return Err(SynthError::GeneratorFailed {
                code: status.code(),
                log,
            });
        }
        Ok(log)
    }
}
