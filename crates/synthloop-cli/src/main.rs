mod cmd_flags;
mod cmd_run;
mod cmd_versions;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Exit status when there was nothing to commit.
const EXIT_CODE_SKIPPED: u8 = 28;

#[derive(Parser, Debug)]
#[command(name = "synthloop")]
#[command(about = "Regenerate client libraries and attribute each change to the version that caused it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Regenerate the repository and open pull requests
    Run(cmd_run::RunArgs),
    /// Show the loop flags a generator config script declares
    Flags {
        /// Generator config script
        #[arg(default_value = "synth.py")]
        synth_file: PathBuf,
    },
    /// List the source versions the loop would walk through
    Versions {
        /// Metadata file
        #[arg(short, long, default_value = "synth.metadata")]
        metadata: PathBuf,

        /// Skip the regenerated repository's own `self` version
        #[arg(long)]
        no_self: bool,
    },
}

/// What a command wants the process to report.
enum Status {
    Success,
    Skipped,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synthloop=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(Status::Success) => ExitCode::SUCCESS,
        Ok(Status::Skipped) => ExitCode::from(EXIT_CODE_SKIPPED),
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "synthloop failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<Status> {
    match cli.command {
        Commands::Run(args) => cmd_run::run(args),
        Commands::Flags { synth_file } => {
            cmd_flags::run(&synth_file, cli.pretty)?;
            Ok(Status::Success)
        }
        Commands::Versions { metadata, no_self } => {
            cmd_versions::run(&metadata, no_self, cli.pretty)?;
            Ok(Status::Success)
        }
    }
}
