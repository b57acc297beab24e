use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::stats::Telemetry;

/// Backoff never grows past this, however long the source stays down.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("restart budget exhausted after {0} restarts")]
    BudgetExhausted(u32),
}

/// Watchdog evaluation plus the exponential-backoff restart state machine.
/// Owned by the supervising task; the backoff sleep runs there and never
/// delays feeders or telemetry.
pub struct RestartController {
    stats: Arc<Telemetry>,
    base_delay: Duration,
    backoff: Duration,
    restarts: u32,
    /// 0 = unlimited.
    max_restarts: u32,
}

impl RestartController {
    pub fn new(base_delay: Duration, max_restarts: u32, stats: Arc<Telemetry>) -> Self {
        Self {
            stats,
            base_delay,
            backoff: base_delay,
            restarts: 0,
            max_restarts,
        }
    }

    /// Unhealthy iff the pipeline has produced at least one unit and has
    /// then gone silent past the timeout. A pipeline that has never produced
    /// is presumed still starting up and is never flagged by elapsed time.
    pub fn check_health(&self, watchdog_timeout: Duration) -> Health {
        let since = self.stats.seconds_since_last_unit();
        if self.stats.frame_count() > 0 && since > watchdog_timeout.as_secs_f64() {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }

    /// Tear-down has already happened; sleep the current backoff, then try
    /// `rebuild`. Returns Ok(true) on a successful restart (backoff and
    /// per-run telemetry reset), Ok(false) when the rebuild failed (the next
    /// health check fires again with a doubled backoff), and the budget
    /// error without attempting anything once the limit is reached.
    pub async fn attempt_restart<F, Fut>(&mut self, rebuild: F) -> Result<bool, RestartError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.max_restarts > 0 && self.restarts >= self.max_restarts {
            return Err(RestartError::BudgetExhausted(self.restarts));
        }
        self.restarts += 1;
        self.stats.on_restart();

        let delay = self.backoff;
        log::warn!("restart #{} in {:.1}s", self.restarts, delay.as_secs_f64());
        tokio::time::sleep(delay).await;
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);

        match rebuild().await {
            Ok(()) => {
                self.backoff = self.base_delay;
                self.stats.reset_run();
                log::info!("restart #{} ok", self.restarts);
                Ok(true)
            }
            Err(e) => {
                log::error!("restart #{} rebuild failed: {:#}", self.restarts, e);
                Ok(false)
            }
        }
    }

    pub fn restarts_so_far(&self) -> u32 {
        self.restarts
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff
    }
}

#[cfg(test)]
#[path = "restart_test.rs"]
mod restart_test;
