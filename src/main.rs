mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use layerpush::config::CliOverrides;

#[derive(Parser)]
#[command(name = "layerpush")]
#[command(about = "Push a local container image to a registry as a signed manifest")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export an image and publish it under <name>:<commit>
    Push {
        /// Local image reference (name[:tag])
        image: String,

        /// Destination repository name
        #[arg(long)]
        name: String,

        /// Commit identifier, used as the manifest tag
        #[arg(long)]
        commit: String,

        /// Registry root directory [env: LAYERPUSH_REGISTRY]
        #[arg(long)]
        registry: Option<PathBuf>,

        /// PKCS#8 PEM signing key, generated fresh when omitted [env: LAYERPUSH_KEY]
        #[arg(long)]
        key: Option<PathBuf>,

        /// Read a previously saved archive (.tar, .tar.gz) instead of running the runtime
        #[arg(long)]
        archive: Option<PathBuf>,

        /// Container runtime binary, docker or podman [env: LAYERPUSH_RUNTIME]
        #[arg(long)]
        runtime: Option<String>,

        /// Maximum number of layers in the ancestry chain
        #[arg(long)]
        max_depth: Option<usize>,

        /// Run the whole pipeline against an in-memory registry
        #[arg(long)]
        dry_run: bool,

        /// Disable progress output
        #[arg(long)]
        no_progress: bool,
    },

    /// Generate a P-256 signing key
    Keygen {
        /// Output path for the PEM file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check the signature of a signed manifest file
    Verify {
        /// Path to the signed manifest
        file: PathBuf,
    },
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Push {
            image,
            name,
            commit,
            registry,
            key,
            archive,
            runtime,
            max_depth,
            dry_run,
            no_progress,
        } => {
            let overrides = CliOverrides {
                runtime,
                registry,
                key,
                max_depth,
                no_progress,
                dry_run,
            };
            cmd::push::run(&image, &name, &commit, archive, overrides)
        }
        Commands::Keygen { path, force } => cmd::keygen::run(&path, force),
        Commands::Verify { file } => cmd::verify::run(&file),
    }
}
