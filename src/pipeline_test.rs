use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::config::{AppConfig, EncoderConfig, SourceConfig};
use crate::stage::{StageError, StageFault, StagePart, UnitReceiver, UNIT_CHANNEL_CAP};

/// Per-built-stage handles the tests poke at.
struct StageProbe {
    fault: Arc<Mutex<Option<StageFault>>>,
    bitrates: Arc<Mutex<Vec<(u32, u32)>>>,
    torn_down: Arc<AtomicBool>,
}

struct MockStage {
    rx: Option<UnitReceiver>,
    fault: Arc<Mutex<Option<StageFault>>>,
    bitrates: Arc<Mutex<Vec<(u32, u32)>>>,
    torn_down: Arc<AtomicBool>,
}

impl TranscodeStage for MockStage {
    fn activate(&mut self) -> Result<UnitReceiver, StageError> {
        self.rx
            .take()
            .ok_or_else(|| StageError::Activate(anyhow::anyhow!("already activated")))
    }

    fn update_bitrate(&self, target_kbps: u32, max_kbps: u32) {
        self.bitrates.lock().unwrap().push((target_kbps, max_kbps));
    }

    fn take_fault(&self) -> Option<StageFault> {
        self.fault.lock().unwrap().take()
    }

    fn teardown(self: Box<Self>) {
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

/// Factory that records every build and can be told to fail specific build
/// attempts (1-based) to exercise the failed-rebuild path.
struct MockFactory {
    builds: AtomicU32,
    fail_builds: Mutex<Vec<u32>>,
    probes: Mutex<Vec<StageProbe>>,
}

impl MockFactory {
    fn new() -> Self {
        Self {
            builds: AtomicU32::new(0),
            fail_builds: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
        }
    }

    fn fail_build(&self, n: u32) {
        self.fail_builds.lock().unwrap().push(n);
    }

    fn build_count(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }

    fn probe(&self, index: usize) -> StageProbe {
        let probes = self.probes.lock().unwrap();
        let p = &probes[index];
        StageProbe {
            fault: Arc::clone(&p.fault),
            bitrates: Arc::clone(&p.bitrates),
            torn_down: Arc::clone(&p.torn_down),
        }
    }
}

impl StageFactory for MockFactory {
    fn build(
        &self,
        _source: &SourceConfig,
        _encoder: &EncoderConfig,
        _stats: Arc<Telemetry>,
    ) -> Result<Box<dyn TranscodeStage>, StageError> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_builds.lock().unwrap().contains(&n) {
            return Err(StageError::build(
                StagePart::Acquisition,
                anyhow::anyhow!("simulated source outage"),
            ));
        }
        let (_tx, rx) = tokio::sync::mpsc::channel(UNIT_CHANNEL_CAP);
        let probe = StageProbe {
            fault: Arc::new(Mutex::new(None)),
            bitrates: Arc::new(Mutex::new(Vec::new())),
            torn_down: Arc::new(AtomicBool::new(false)),
        };
        let stage = MockStage {
            rx: Some(rx),
            fault: Arc::clone(&probe.fault),
            bitrates: Arc::clone(&probe.bitrates),
            torn_down: Arc::clone(&probe.torn_down),
        };
        self.probes.lock().unwrap().push(probe);
        Ok(Box::new(stage))
    }
}

fn test_config(watchdog_s: u64, max_restarts: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.resilience.watchdog_timeout_s = watchdog_s;
    config.resilience.max_restarts = max_restarts;
    config.source.reconnect_delay_s = 0;
    config.stats.enabled = false;
    config
}

async fn wait_until(what: &str, timeout: Duration, f: impl Fn() -> bool) {
    let start = std::time::Instant::now();
    while !f() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn stop_is_idempotent() {
    let factory = Arc::new(MockFactory::new());
    let manager = PipelineManager::new(test_config(3600, 0), factory.clone());
    manager.start().await.unwrap();
    assert!(manager.is_running());

    manager.stop().await;
    assert!(!manager.is_running());
    assert!(factory.probe(0).torn_down.load(Ordering::SeqCst));
    assert!(!manager.failed());

    // Second stop is a no-op.
    manager.stop().await;
    assert!(manager.terminated().is_cancelled());
}

#[tokio::test]
async fn set_bitrate_reaches_stage_without_restart() {
    let factory = Arc::new(MockFactory::new());
    let manager = PipelineManager::new(test_config(3600, 0), factory.clone());
    manager.start().await.unwrap();

    manager.stats().on_unit();
    manager.stats().on_unit();
    let frames_before = manager.stats().frame_count();

    manager.set_bitrate(500, 800).await.unwrap();
    manager.set_bitrate(1000, 1500).await.unwrap();
    assert_eq!(
        factory.probe(0).bitrates.lock().unwrap().as_slice(),
        &[(500, 800), (1000, 1500)]
    );

    // Invalid requests are rejected and change nothing.
    assert!(manager.set_bitrate(2000, 1500).await.is_err());
    assert!(manager.set_bitrate(0, 1500).await.is_err());
    assert_eq!(factory.probe(0).bitrates.lock().unwrap().len(), 2);

    assert_eq!(manager.stats().frame_count(), frames_before);
    assert_eq!(manager.stats().restart_count(), 0);
    assert_eq!(factory.build_count(), 1);

    manager.stop().await;
}

#[tokio::test]
async fn stall_triggers_teardown_then_rebuild() {
    let factory = Arc::new(MockFactory::new());
    let manager = PipelineManager::new(test_config(1, 0), factory.clone());
    manager.start().await.unwrap();

    // Produce once, then go silent past the watchdog timeout.
    manager.stats().on_unit();

    wait_until("restart", Duration::from_secs(6), || {
        manager.stats().restart_count() == 1
    })
    .await;
    wait_until("rebuild", Duration::from_secs(2), || factory.build_count() == 2).await;

    // Old instance gone before the new one came up, run counters reset.
    assert!(factory.probe(0).torn_down.load(Ordering::SeqCst));
    wait_until("run reset", Duration::from_secs(2), || {
        manager.stats().frame_count() == 0
    })
    .await;

    manager.stop().await;
    assert!(!manager.failed());
}

#[tokio::test]
async fn failed_rebuild_is_retried_next_tick() {
    let factory = Arc::new(MockFactory::new());
    factory.fail_build(2);
    let manager = PipelineManager::new(test_config(1, 0), factory.clone());
    manager.start().await.unwrap();

    manager.stats().on_unit();

    // Attempt #1 hits the simulated outage; the stall persists, so the next
    // tick attempts again and succeeds.
    wait_until("second restart", Duration::from_secs(10), || {
        manager.stats().restart_count() == 2
    })
    .await;
    wait_until("successful rebuild", Duration::from_secs(2), || {
        factory.build_count() == 3
    })
    .await;

    assert!(!manager.failed());
    manager.stop().await;
}

#[tokio::test]
async fn fault_counts_reconnect_and_restarts() {
    let factory = Arc::new(MockFactory::new());
    let manager = PipelineManager::new(test_config(3600, 0), factory.clone());
    manager.start().await.unwrap();

    manager.stats().on_unit();
    *factory.probe(0).fault.lock().unwrap() = Some(StageFault::EndOfStream);

    wait_until("fault restart", Duration::from_secs(4), || {
        manager.stats().restart_count() == 1
    })
    .await;
    assert_eq!(manager.stats().reconnect_count(), 1);
    wait_until("rebuild", Duration::from_secs(2), || factory.build_count() == 2).await;

    manager.stop().await;
}

#[tokio::test]
async fn budget_exhaustion_terminates_pipeline() {
    let factory = Arc::new(MockFactory::new());
    let manager = PipelineManager::new(test_config(1, 1), factory.clone());
    manager.start().await.unwrap();

    manager.stats().on_unit();
    wait_until("restart", Duration::from_secs(6), || {
        manager.stats().restart_count() == 1
    })
    .await;

    // Stall the replacement run too; the budget of one is now spent.
    wait_until("rebuild", Duration::from_secs(2), || factory.build_count() == 2).await;
    wait_until("run reset", Duration::from_secs(2), || {
        manager.stats().frame_count() == 0
    })
    .await;
    manager.stats().on_unit();

    let terminated = manager.terminated();
    tokio::time::timeout(Duration::from_secs(8), terminated.cancelled())
        .await
        .expect("pipeline should give up");
    assert!(manager.failed());
    // The second restart was never attempted.
    assert_eq!(factory.build_count(), 2);
}
