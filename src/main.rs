use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod api;
mod bridge;
mod config;
mod ffmpeg;
mod pipeline;
mod restart;
mod serve;
mod stage;
mod stats;

use config::{AppConfig, OutputMode};
use pipeline::PipelineManager;

/// RTSP live re-encoder: pulls one RTSP source, transcodes it with a
/// hardware encoder when available, and serves the compressed stream to
/// downstream consumers.
#[derive(Debug, Parser)]
#[command(name = "rtsp-reenc", version)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

/// Encoder teardown can wedge inside driver code; once shutdown starts we
/// give it this long and then leave anyway.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let code = match run(&args).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = AppConfig::load(&args.config)?;
    config.validate()?;
    config.log_summary();

    ffmpeg::init()?;

    let cancel = CancellationToken::new();
    let manager = PipelineManager::new(config.clone(), Arc::new(ffmpeg::FfmpegStageFactory));
    manager.start().await?;

    if config.output.mode == OutputMode::Server {
        let server_manager = manager.clone();
        let server_cancel = cancel.clone();
        let bind = config.output.bind.clone();
        let port = config.output.port;
        tokio::spawn(async move {
            if let Err(e) =
                serve::start_stream_server(server_manager, &bind, port, server_cancel).await
            {
                log::error!("stream server: {:#}", e);
            }
        });
    }

    if config.control.enabled {
        let api_manager = manager.clone();
        let api_cancel = cancel.clone();
        let listen = config.control.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_control_api(api_manager, &listen, api_cancel).await {
                log::error!("control api: {:#}", e);
            }
        });
    }

    let terminated = manager.terminated();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt, shutting down");
        }
        _ = terminated.cancelled() => {}
    }
    cancel.cancel();

    // If library teardown wedges, this kills the process once the grace
    // period is over; the orderly path below exits first.
    let code = if manager.failed() { 1 } else { 0 };
    std::thread::spawn(move || {
        std::thread::sleep(EXIT_GRACE);
        log::warn!("shutdown did not finish in {:?}, exiting anyway", EXIT_GRACE);
        std::process::exit(code);
    });

    manager.stop().await;
    log::info!("final: {}", manager.stats().peek());

    if manager.failed() {
        anyhow::bail!("pipeline gave up after repeated restarts");
    }
    Ok(())
}
