use std::path::Path;

use serde::Deserialize;

/// Upstream RTSP source settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
    /// "tcp" or "udp"
    pub transport: String,
    /// Acquisition latency budget handed to the demuxer.
    pub latency_ms: u32,
    pub tcp_timeout_ms: u64,
    pub retry_count: u32,
    /// Base delay before the first restart attempt. Doubles per failed
    /// attempt, capped at 30s.
    pub reconnect_delay_s: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://192.168.1.120:554/test".to_string(),
            transport: "tcp".to_string(),
            latency_ms: 200,
            tcp_timeout_ms: 5000,
            retry_count: 5,
            reconnect_delay_s: 3,
        }
    }
}

/// Encoder settings. `target_bitrate_kbps`/`max_bitrate_kbps` are the only
/// fields that can change at runtime (see `PipelineManager::set_bitrate`).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub target_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    /// IDR/GOP interval in frames.
    pub idr_interval: u32,
    pub preset: String,
    pub profile: String,
    /// "cbr" or "vbr"
    pub control_rate: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
            target_bitrate_kbps: 1800,
            max_bitrate_kbps: 2000,
            idr_interval: 30,
            preset: "ultrafast".to_string(),
            profile: "high".to_string(),
            control_rate: "cbr".to_string(),
        }
    }
}

/// Where produced units go.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Single permanently-attached byte-stream feeder writing to stdout
    /// (lowest latency, for `exec:` style downstream consumers).
    DirectStream,
    /// TCP listener; every connected client gets its own feeder.
    Server,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mode: OutputMode,
    pub bind: String,
    pub port: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Server,
            bind: "0.0.0.0".to_string(),
            port: 8554,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    pub interval_s: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Watchdog fires when no unit has been produced for this long.
    pub watchdog_timeout_s: u64,
    /// 0 = unlimited.
    pub max_restarts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_s: 10,
            max_restarts: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub encoder: EncoderConfig,
    pub output: OutputConfig,
    pub stats: StatsConfig,
    pub resilience: ResilienceConfig,
    pub control: ControlConfig,
}

impl AppConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.url.is_empty() {
            anyhow::bail!("source.url is empty");
        }
        match self.source.transport.as_str() {
            "tcp" | "udp" => {}
            other => anyhow::bail!("source.transport must be tcp or udp, got {:?}", other),
        }
        if !(16..=7680).contains(&self.encoder.width) || !(16..=4320).contains(&self.encoder.height)
        {
            anyhow::bail!(
                "encoder resolution out of range: {}x{}",
                self.encoder.width,
                self.encoder.height
            );
        }
        if !(1..=240).contains(&self.encoder.framerate) {
            anyhow::bail!("encoder.framerate out of range: {}", self.encoder.framerate);
        }
        if self.encoder.target_bitrate_kbps == 0 || self.encoder.max_bitrate_kbps == 0 {
            anyhow::bail!("encoder bitrates must be > 0");
        }
        if self.encoder.target_bitrate_kbps > self.encoder.max_bitrate_kbps {
            anyhow::bail!(
                "encoder.target_bitrate_kbps ({}) > encoder.max_bitrate_kbps ({})",
                self.encoder.target_bitrate_kbps,
                self.encoder.max_bitrate_kbps
            );
        }
        if !(1..=600).contains(&self.encoder.idr_interval) {
            anyhow::bail!(
                "encoder.idr_interval out of range: {}",
                self.encoder.idr_interval
            );
        }
        match self.encoder.control_rate.as_str() {
            "cbr" | "vbr" => {}
            other => anyhow::bail!("encoder.control_rate must be cbr or vbr, got {:?}", other),
        }
        if self.resilience.watchdog_timeout_s == 0 {
            anyhow::bail!("resilience.watchdog_timeout_s must be > 0");
        }
        if self.stats.enabled && self.stats.interval_s == 0 {
            anyhow::bail!("stats.interval_s must be > 0 when stats are enabled");
        }
        Ok(())
    }

    /// One-line-per-section summary, logged once at startup.
    pub fn log_summary(&self) {
        log::info!(
            "source: {} ({}, latency {}ms)",
            self.source.url,
            self.source.transport,
            self.source.latency_ms
        );
        log::info!(
            "encoder: {}x{}@{} target={}kbps max={}kbps idr={} preset={} profile={} rc={}",
            self.encoder.width,
            self.encoder.height,
            self.encoder.framerate,
            self.encoder.target_bitrate_kbps,
            self.encoder.max_bitrate_kbps,
            self.encoder.idr_interval,
            self.encoder.preset,
            self.encoder.profile,
            self.encoder.control_rate
        );
        match self.output.mode {
            OutputMode::DirectStream => log::info!("output: stdout byte-stream"),
            OutputMode::Server => {
                log::info!("output: tcp server {}:{}", self.output.bind, self.output.port)
            }
        }
        log::info!(
            "resilience: watchdog={}s max_restarts={} reconnect_base={}s",
            self.resilience.watchdog_timeout_s,
            self.resilience.max_restarts,
            self.source.reconnect_delay_s
        );
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
