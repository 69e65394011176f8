//! hoser CLI: runs `.hos` pipeline scripts.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use hoser_core::config::load_from_paths;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hoser::{
    Command, ConfigArgs, Interpreter, Settings, Supervisor, init_metrics, init_tracing,
    read_script_file, shutdown_signal, stopped_cleanly,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline script until it exits or is interrupted
    Run(RunArgs),
    /// Parse a pipeline script and print it back in normalized form
    Check {
        /// Script to check
        script: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Log debug information to stderr
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    config: ConfigArgs,

    /// Script to run
    script: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { script } => check(&script),
    }
}

fn load_script(script: &Path) -> Option<Vec<Command>> {
    match read_script_file(script) {
        Ok(commands) => Some(commands),
        Err(e) => {
            eprintln!("{}: {e}", script.display());
            None
        }
    }
}

fn check(script: &Path) -> ExitCode {
    let Some(commands) = load_script(script) else {
        return ExitCode::FAILURE;
    };
    for command in &commands {
        println!("{command}");
    }
    ExitCode::SUCCESS
}

async fn run(args: RunArgs) -> ExitCode {
    init_tracing(args.verbose);

    let Some(commands) = load_script(&args.script) else {
        return ExitCode::FAILURE;
    };

    let config = match load_from_paths(&args.config.config_paths()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(address) = &config.metrics.address
        && let Err(e) = init_metrics(address)
    {
        eprintln!("Failed to start metrics server: {e}");
        return ExitCode::FAILURE;
    }

    let supervisor = Supervisor::new(config.runtime.work_dir(), Settings::from(&config.runtime));
    let interpreter =
        Interpreter::new(supervisor.clone()).with_startup_timeout(config.runtime.startup_timeout());
    info!(
        script = %args.script.display(),
        commands = commands.len(),
        work_dir = %supervisor.dir().display(),
        "Starting"
    );

    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let shutdown = shutdown.clone();
        let interrupted = interrupted.clone();
        async move {
            shutdown_signal().await;
            interrupted.store(true, Ordering::Release);
            shutdown.cancel();
        }
    });

    let done = supervisor.serve_background(shutdown.clone());
    for command in &commands {
        if shutdown.is_cancelled() {
            break;
        }
        if let Err(e) = interpreter.exec(&shutdown, command).await {
            eprintln!("error: {e}\n\tcontext: {command}");
        }
    }

    let code = match done.await {
        Ok(_) if interrupted.load(Ordering::Acquire) => {
            info!("Interrupted");
            ExitCode::FAILURE
        }
        Ok(result) if stopped_cleanly(&result) => {
            info!("Exiting");
            ExitCode::SUCCESS
        }
        Ok(result) => {
            if let Err(e) = result {
                error!(error = %e, "Serve failed");
            }
            ExitCode::FAILURE
        }
        Err(_) => {
            error!("Supervisor task ended without a result");
            ExitCode::FAILURE
        }
    };

    if let Err(e) = supervisor.close() {
        warn!(error = %e, "Failed to clean up");
    }
    code
}
