use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::config::{EncoderConfig, SourceConfig};
use crate::stats::Telemetry;

/// One time-ordered chunk of compressed output. Immutable once produced;
/// cloning is cheap (`Bytes`), so every attached consumer gets its own copy.
#[derive(Clone, Debug)]
pub struct ProducedUnit {
    pub data: Bytes,
    /// Presentation timestamp in the encoder time base, when known.
    pub pts: Option<i64>,
    pub is_key: bool,
}

pub type UnitSender = tokio::sync::mpsc::Sender<ProducedUnit>;
pub type UnitReceiver = tokio::sync::mpsc::Receiver<ProducedUnit>;

/// Capacity of the stage → bridge channel. The producing chain never blocks
/// on it: when full, units are dropped at the producer side.
pub const UNIT_CHANNEL_CAP: usize = 64;

/// Which logical stage of the chain failed to come up. Lets operators tell
/// missing hardware/codec support apart from a dead source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagePart {
    Acquisition,
    Decode,
    Transform,
    Encode,
}

impl Display for StagePart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StagePart::Acquisition => "acquisition",
            StagePart::Decode => "decode",
            StagePart::Transform => "transform",
            StagePart::Encode => "encode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{part} stage build failed: {source}")]
    Build {
        part: StagePart,
        #[source]
        source: anyhow::Error,
    },
    #[error("stage activation failed: {0}")]
    Activate(#[source] anyhow::Error),
}

impl StageError {
    pub fn build(part: StagePart, source: impl Into<anyhow::Error>) -> Self {
        Self::Build {
            part,
            source: source.into(),
        }
    }
}

/// Fatal mid-run signal from the producing chain. Observed by the
/// supervising loop on its next tick via `take_fault`; it never has to poll
/// chain internals.
#[derive(Clone, Debug)]
pub enum StageFault {
    Error(String),
    EndOfStream,
}

impl Display for StageFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StageFault::Error(msg) => write!(f, "stage error: {}", msg),
            StageFault::EndOfStream => f.write_str("end of stream"),
        }
    }
}

/// The always-on transcode stage: an opaque acquisition → decode →
/// transform → encode chain. Exactly one instance is active at a time;
/// a restart is teardown-then-rebuild through the factory.
pub trait TranscodeStage: Send {
    /// Transition the assembled chain to producing. Returns the single pull
    /// side for produced units. On error the caller must still call
    /// `teardown`; activation itself retains no partial state.
    fn activate(&mut self) -> Result<UnitReceiver, StageError>;

    /// Apply a new target/max bitrate to the live encoder. Safe while
    /// producing; never rebuilds or interrupts output.
    fn update_bitrate(&self, target_kbps: u32, max_kbps: u32);

    /// One-shot: returns the pending fatal fault, if any, and clears it.
    fn take_fault(&self) -> Option<StageFault>;

    /// Stop the producing context and wait, within an implementation bound,
    /// for the producing thread to exit. After return the instance no
    /// longer touches shared telemetry; a wedged library teardown past the
    /// bound is left to the process-level exit grace.
    fn teardown(self: Box<Self>);
}

/// Builds transcode stages. `build` fails fast with the failing part and
/// retains nothing on error. Implementations may put any acceleration
/// library behind this seam.
pub trait StageFactory: Send + Sync {
    fn build(
        &self,
        source: &SourceConfig,
        encoder: &EncoderConfig,
        stats: Arc<Telemetry>,
    ) -> Result<Box<dyn TranscodeStage>, StageError>;
}
