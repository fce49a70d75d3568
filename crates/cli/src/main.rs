//! CLI entry point for the stream recorder
//!
//! Records `--minutes` of `--url` into `--name`, serving `/status` while it runs.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use stream_recorder::{run_startup_checks, run_status_server, Config, Recorder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound on how long shutdown waits for the session to wind down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Record a live stream to a fixed-length file, riding out outages
#[derive(Parser, Debug)]
#[command(name = "stream-recorder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream URL to record
    #[arg(short, long)]
    url: String,

    /// Amount of stream content to record, in minutes
    #[arg(short, long)]
    minutes: u32,

    /// Name of the final output file; the container extension is added if missing
    #[arg(short, long)]
    name: String,

    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the output directory from the configuration
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Skip the ffmpeg/ffprobe version checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stream_recorder=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = args.output_dir {
        config.output.directory = dir;
    }

    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!("startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let recorder = Arc::new(Recorder::new(&config, args.url));

    if config.status.enabled {
        let recorder = recorder.clone();
        let addr = config.status.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(recorder, &addr).await {
                warn!("status server stopped: {}", e);
            }
        });
    }

    info!(
        url = recorder.url(),
        minutes = args.minutes,
        output = %config.output.directory.display(),
        "recorder starting"
    );

    let mut task = {
        let recorder = recorder.clone();
        let name = args.name;
        let minutes = args.minutes;
        tokio::spawn(async move { recorder.start_recording(minutes, &name).await })
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping");
            recorder.stop();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!("recording did not stop within {:?}", SHUTDOWN_TIMEOUT);
                    task.abort();
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    match joined {
        Ok(Ok(path)) => {
            info!(path = %path.display(), "recording complete");
            println!("{}", path.display());
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("recording failed: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("recording task panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}
