//! snapsync - three-way sync of a working copy with a snapshot-backed remote.

mod backend;
mod error;
mod output;
mod shutdown;

use clap::{Parser, Subcommand};
use snapsync_core::config::BackendKind;
use snapsync_core::{utils, Config, SyncContext, SyncExecutor, SyncOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: <root>/.snapsync/config.toml)
    #[arg(short, long, value_name = "FILE", env = "SNAPSYNC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "SNAPSYNC_LOG", global = true)]
    log_level: Option<String>,

    /// Working copy root
    #[arg(short = 'C', long, value_name = "DIR", default_value = ".", global = true)]
    root: PathBuf,

    /// Remote directory (directory backend; overrides config)
    #[arg(short, long, value_name = "DIR", global = true)]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what a sync would do
    Status {
        /// Print a JSON document instead of text
        #[arg(long)]
        json: bool,
    },
    /// Synchronize the working copy with the remote
    Sync {
        /// Snapshot message
        #[arg(short, long)]
        message: Option<String>,

        /// Rename non-NFC file names instead of refusing to sync
        #[arg(long)]
        auto_normalize: bool,
    },
    /// Publish this working copy to an empty remote
    Init {
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Populate an empty working copy from the remote
    Clone,
    /// Finish or undo an interrupted transaction
    Recover,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, CliError> {
    if matches!(args.command, Command::Clone) {
        std::fs::create_dir_all(&args.root)
            .map_err(|e| CliError::Usage(format!("cannot create {}: {e}", args.root.display())))?;
    }

    let mut config = Config::load(args.config.as_deref(), &args.root)?;
    if let Some(remote) = args.remote {
        if config.remote.backend != BackendKind::Directory {
            return Err(CliError::Usage(
                "--remote only applies to the directory backend".into(),
            ));
        }
        config.remote.path = Some(remote);
    }

    match args.log_level.as_deref() {
        Some(level) => utils::logger::init(level)?,
        None => utils::logger::init_from_config(&config.log)?,
    }

    tracing::debug!(
        "Starting snapsync v{} in {}",
        env!("CARGO_PKG_VERSION"),
        config.repository.root.display()
    );

    let cancel = CancellationToken::new();
    let listener = tokio::spawn(shutdown::shutdown_signal(cancel.clone()));
    let ctx = SyncContext::new(config).with_cancel(cancel.clone());

    // The core is blocking; keep it off the runtime threads.
    let command = args.command;
    let result = tokio::task::spawn_blocking(move || execute(&ctx, command))
        .await
        .map_err(anyhow::Error::from)?;

    cancel.cancel();
    let _ = listener.await;
    result
}

fn execute(ctx: &SyncContext, command: Command) -> Result<ExitCode, CliError> {
    let backend = backend::open(&ctx.config)?;
    let executor = SyncExecutor::new(ctx, backend.remote.as_ref(), backend.transport.as_ref());

    match command {
        Command::Status { json } => {
            let report = executor.status()?;
            if json {
                let doc = serde_json::to_string_pretty(&output::status_json(&report))
                    .map_err(anyhow::Error::from)?;
                println!("{doc}");
            } else {
                println!("{}", output::status_text(&report));
            }
        }
        Command::Sync {
            message,
            auto_normalize,
        } => {
            let report = executor.sync(&SyncOptions {
                auto_normalize,
                message,
            })?;
            println!("{}", output::sync_text(&report));
        }
        Command::Init { message } => {
            let report = executor.init(&SyncOptions {
                message,
                ..SyncOptions::default()
            })?;
            println!("{}", output::sync_text(&report));
        }
        Command::Clone => {
            let report = executor.clone_remote(&SyncOptions::default())?;
            println!("{}", output::sync_text(&report));
        }
        Command::Recover => {
            let outcome = executor.recover()?;
            println!("{}", output::recovery_text(&outcome));
        }
    }
    Ok(ExitCode::SUCCESS)
}
