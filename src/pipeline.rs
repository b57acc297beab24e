//! Pipeline lifecycle: owns the single active transcode stage, the fan-out
//! bridge, and the supervising task that watches health and drives
//! teardown-then-rebuild restarts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::bridge::{ConsumerSink, OutputBridge};
use crate::config::{AppConfig, OutputMode};
use crate::restart::{Health, RestartController};
use crate::stage::{StageFactory, TranscodeStage};
use crate::stats::Telemetry;

/// Supervising cadence. Health, faults and the stats interval are all
/// evaluated on this clock.
const TICK: Duration = Duration::from_secs(1);

struct Inner {
    factory: Arc<dyn StageFactory>,
    stats: Arc<Telemetry>,
    bridge: OutputBridge,
    /// Working copy; runtime bitrate changes land here so they survive
    /// restarts.
    config: std::sync::Mutex<AppConfig>,
    stage: tokio::sync::Mutex<Option<Box<dyn TranscodeStage>>>,
    running: AtomicBool,
    failed: AtomicBool,
    /// Stops the supervising task, the current run and all feeders.
    cancel: CancellationToken,
    /// Fires when the pipeline will not continue: budget exhausted, or
    /// stopped.
    terminated: CancellationToken,
}

impl Inner {
    /// Build and activate a fresh stage, then hand its unit channel to the
    /// bridge as a new run. The previous run's consumers see their channel
    /// close and are dropped; in direct-stream mode the stdout feeder is
    /// re-attached here so output resumes without outside help.
    async fn rebuild(&self) -> anyhow::Result<()> {
        let (source, encoder, mode) = {
            let config = self.config.lock().unwrap();
            (config.source.clone(), config.encoder.clone(), config.output.mode)
        };

        let factory = Arc::clone(&self.factory);
        let stats = Arc::clone(&self.stats);
        let mut stage =
            tokio::task::spawn_blocking(move || factory.build(&source, &encoder, stats))
                .await
                .map_err(|e| anyhow::anyhow!("stage build task: {}", e))??;

        let units = match stage.activate() {
            Ok(units) => units,
            Err(e) => {
                let _ = tokio::task::spawn_blocking(move || stage.teardown()).await;
                return Err(e.into());
            }
        };

        self.bridge.begin_run(units, self.cancel.child_token());
        *self.stage.lock().await = Some(stage);

        if mode == OutputMode::DirectStream {
            let sink: ConsumerSink = Box::new(tokio::io::stdout());
            self.bridge.attach_consumer("stdout", sink).await?;
        }
        Ok(())
    }

    /// Remove and tear down the active stage, if any. Teardown can block in
    /// library code, so it runs off the async workers.
    async fn teardown_stage(&self) {
        let stage = self.stage.lock().await.take();
        if let Some(stage) = stage {
            let _ = tokio::task::spawn_blocking(move || stage.teardown()).await;
        }
    }
}

/// Handle to the running pipeline. Cloneable; all clones drive the same
/// pipeline.
#[derive(Clone)]
pub struct PipelineManager {
    inner: Arc<Inner>,
}

impl PipelineManager {
    pub fn new(config: AppConfig, factory: Arc<dyn StageFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                stats: Arc::new(Telemetry::new()),
                bridge: OutputBridge::new(),
                config: std::sync::Mutex::new(config),
                stage: tokio::sync::Mutex::new(None),
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                terminated: CancellationToken::new(),
            }),
        }
    }

    pub fn stats(&self) -> Arc<Telemetry> {
        Arc::clone(&self.inner.stats)
    }

    pub fn bridge(&self) -> OutputBridge {
        self.inner.bridge.clone()
    }

    /// Fires when the pipeline has permanently stopped. `failed()` tells
    /// whether that was a budget exhaustion or an orderly `stop`.
    pub fn terminated(&self) -> CancellationToken {
        self.inner.terminated.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Bring up the first stage and spawn the supervising task. An initial
    /// build failure is returned to the caller rather than retried; the
    /// restart machinery only covers pipelines that once ran.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("pipeline already running");
        }
        self.inner.stats.reset_run();
        if let Err(e) = self.inner.rebuild().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        log::info!("pipeline started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            supervise(inner).await;
        });
        Ok(())
    }

    /// Orderly shutdown: stop supervising, tear down the stage, join every
    /// feeder. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.teardown_stage().await;
        self.inner.bridge.shutdown().await;
        self.inner.terminated.cancel();
        log::info!("pipeline stopped");
    }

    /// Runtime bitrate change. Updates the working configuration (so the
    /// values persist across restarts) and forwards to the live encoder if
    /// a stage is up. Never interrupts the run and never touches telemetry.
    pub async fn set_bitrate(&self, target_kbps: u32, max_kbps: u32) -> anyhow::Result<()> {
        if target_kbps == 0 || max_kbps == 0 {
            anyhow::bail!("bitrates must be > 0");
        }
        if target_kbps > max_kbps {
            anyhow::bail!("target ({} kbps) exceeds max ({} kbps)", target_kbps, max_kbps);
        }
        {
            let mut config = self.inner.config.lock().unwrap();
            config.encoder.target_bitrate_kbps = target_kbps;
            config.encoder.max_bitrate_kbps = max_kbps;
        }
        let stage = self.inner.stage.lock().await;
        match stage.as_ref() {
            Some(stage) => stage.update_bitrate(target_kbps, max_kbps),
            None => log::info!("no active stage, bitrate applies on next start"),
        }
        log::info!("bitrate set: target={}kbps max={}kbps", target_kbps, max_kbps);
        Ok(())
    }
}

/// The supervising loop. One tick per second: surface faults, print the
/// periodic stats line, evaluate the watchdog, and when unhealthy run
/// teardown-then-rebuild under the restart controller's backoff and budget.
async fn supervise(inner: Arc<Inner>) {
    let (watchdog, base_delay, max_restarts, stats_enabled, stats_interval) = {
        let config = inner.config.lock().unwrap();
        (
            Duration::from_secs(config.resilience.watchdog_timeout_s),
            Duration::from_secs(config.source.reconnect_delay_s),
            config.resilience.max_restarts,
            config.stats.enabled,
            Duration::from_secs(config.stats.interval_s.max(1)),
        )
    };
    let mut controller = RestartController::new(base_delay, max_restarts, Arc::clone(&inner.stats));
    let mut last_stats = Instant::now();

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(TICK) => {}
        }

        if stats_enabled && last_stats.elapsed() >= stats_interval {
            log::info!("{}", inner.stats.snapshot());
            last_stats = Instant::now();
        }

        let fault = {
            let stage = inner.stage.lock().await;
            stage.as_ref().and_then(|s| s.take_fault())
        };
        let mut force_restart = false;
        if let Some(fault) = fault {
            log::warn!("pipeline fault: {}", fault);
            inner.stats.on_reconnect();
            force_restart = true;
        }

        if !force_restart && controller.check_health(watchdog) == Health::Healthy {
            continue;
        }
        if !force_restart {
            log::warn!(
                "watchdog: no output for {:.1}s (timeout {}s)",
                inner.stats.seconds_since_last_unit(),
                watchdog.as_secs()
            );
        }

        // Never two stage instances: the old one is fully gone before the
        // backoff sleep even starts.
        inner.teardown_stage().await;
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            res = controller.attempt_restart(|| inner.rebuild()) => match res {
                Ok(true) | Ok(false) => {}
                Err(e) => {
                    log::error!("giving up: {:#}", e);
                    inner.failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    if inner.failed.load(Ordering::SeqCst) {
        inner.cancel.cancel();
        inner.teardown_stage().await;
        inner.bridge.shutdown().await;
        inner.running.store(false, Ordering::SeqCst);
        inner.terminated.cancel();
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
