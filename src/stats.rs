use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Live counters for the transcode pipeline. Updated from the producing
/// chain thread, read from the supervising task and the control API; every
/// field is an independent atomic so no lock is ever taken on the hot path.
///
/// Timestamps are stored as nanoseconds since process start, 0 meaning
/// "not yet".
pub struct Telemetry {
    process_start: Instant,
    run_start_ns: AtomicU64,
    frame_count: AtomicU64,
    last_unit_ns: AtomicU64,
    reconnect_count: AtomicU64,
    restart_count: AtomicU64,
    // fps window: state of the previous snapshot
    fps_frames: AtomicU64,
    fps_at_ns: AtomicU64,
    // f64 bits of the most recently computed fps, for peeking
    last_fps: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            process_start: Instant::now(),
            run_start_ns: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
            last_unit_ns: AtomicU64::new(0),
            reconnect_count: AtomicU64::new(0),
            restart_count: AtomicU64::new(0),
            fps_frames: AtomicU64::new(0),
            fps_at_ns: AtomicU64::new(0),
            last_fps: AtomicU64::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        self.process_start.elapsed().as_nanos() as u64
    }

    /// Uptime of the current run, not of the process: `reset_run` re-stamps
    /// the epoch, so the stats line starts over after every restart.
    fn run_uptime_s(&self, now: u64) -> u64 {
        now.saturating_sub(self.run_start_ns.load(Ordering::Relaxed)) / 1_000_000_000
    }

    /// Call on every produced unit. This is the sole liveness signal the
    /// watchdog trusts.
    pub fn on_unit(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        self.last_unit_ns.store(self.now_ns(), Ordering::Relaxed);
    }

    pub fn on_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_restart(&self) {
        self.restart_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero the per-run counters at (re)start. Reconnect/restart counters
    /// describe the whole process and survive.
    pub fn reset_run(&self) {
        self.frame_count.store(0, Ordering::Relaxed);
        self.last_unit_ns.store(0, Ordering::Relaxed);
        self.run_start_ns.store(self.now_ns(), Ordering::Relaxed);
        self.fps_frames.store(0, Ordering::Relaxed);
        self.fps_at_ns.store(0, Ordering::Relaxed);
        self.last_fps.store(0, Ordering::Relaxed);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Watchdog clock. Before the first unit of a run this is the time since
    /// the run started, so a freshly started pipeline reads as "elapsed",
    /// never as zero.
    pub fn seconds_since_last_unit(&self) -> f64 {
        let now = self.now_ns();
        let last = self.last_unit_ns.load(Ordering::Relaxed);
        let since = if last == 0 {
            now.saturating_sub(self.run_start_ns.load(Ordering::Relaxed))
        } else {
            now.saturating_sub(last)
        };
        since as f64 / 1e9
    }

    /// Take a snapshot and advance the fps window. The fps value covers the
    /// interval since the previous snapshot; the first snapshot of a run
    /// reports 0.
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = self.now_ns();
        let frames = self.frame_count.load(Ordering::Relaxed);

        let prev_frames = self.fps_frames.swap(frames, Ordering::Relaxed);
        let prev_at = self.fps_at_ns.swap(now, Ordering::Relaxed);
        let fps = if prev_at > 0 && now > prev_at {
            let dt = (now - prev_at) as f64 / 1e9;
            frames.saturating_sub(prev_frames) as f64 / dt
        } else {
            0.0
        };
        self.last_fps.store(fps.to_bits(), Ordering::Relaxed);

        StatsSnapshot {
            uptime_s: self.run_uptime_s(now),
            frames,
            fps,
            last_unit_s: self.seconds_since_last_unit(),
            reconnects: self.reconnect_count.load(Ordering::Relaxed),
            restarts: self.restart_count.load(Ordering::Relaxed),
        }
    }

    /// Snapshot without touching the fps window. Used by the control API so
    /// out-of-band reads do not skew the periodic fps computation; reports
    /// the fps of the last periodic snapshot.
    pub fn peek(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_s: self.run_uptime_s(self.now_ns()),
            frames: self.frame_count.load(Ordering::Relaxed),
            fps: f64::from_bits(self.last_fps.load(Ordering::Relaxed)),
            last_unit_s: self.seconds_since_last_unit(),
            reconnects: self.reconnect_count.load(Ordering::Relaxed),
            restarts: self.restart_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since the current run started (re-stamped on restart).
    pub uptime_s: u64,
    pub frames: u64,
    pub fps: f64,
    pub last_unit_s: f64,
    pub reconnects: u64,
    pub restarts: u64,
}

impl Display for StatsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let hours = self.uptime_s / 3600;
        let minutes = (self.uptime_s % 3600) / 60;
        let seconds = self.uptime_s % 60;
        write!(
            f,
            "uptime={:02}:{:02}:{:02} | frames={} | fps={:.1} | last_frame={:.1}s ago | reconnects={} | restarts={}",
            hours, minutes, seconds, self.frames, self.fps, self.last_unit_s, self.reconnects, self.restarts
        )
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;
