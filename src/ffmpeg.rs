//! Production transcode stage backed by ffmpeg-next.
//!
//! The whole acquisition → decode → scale → encode chain runs as one
//! blocking loop on a dedicated thread; produced units are pushed into the
//! bounded stage channel without ever blocking the chain.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Rational};
use tokio_util::sync::CancellationToken;

use crate::config::{EncoderConfig, SourceConfig};
use crate::stage::{
    ProducedUnit, StageError, StageFactory, StageFault, StagePart, TranscodeStage, UnitReceiver,
    UnitSender, UNIT_CHANNEL_CAP,
};
use crate::stats::Telemetry;

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg init: {}", e))
}

/// How long teardown waits for the chain thread to wind down. The thread
/// can sit in a blocking read for up to the socket timeout; past this bound
/// we stop waiting and let the process-level exit grace deal with it.
const TEARDOWN_WAIT: Duration = Duration::from_secs(3);

/// Pending runtime bitrate change, published by the adapter and applied by
/// the chain loop between frames.
struct BitrateRequest {
    target_kbps: AtomicU32,
    max_kbps: AtomicU32,
    dirty: AtomicBool,
}

impl BitrateRequest {
    fn new() -> Self {
        Self {
            target_kbps: AtomicU32::new(0),
            max_kbps: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    fn publish(&self, target_kbps: u32, max_kbps: u32) {
        self.target_kbps.store(target_kbps, Ordering::Relaxed);
        self.max_kbps.store(max_kbps, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<(u32, u32)> {
        if self.dirty.swap(false, Ordering::Acquire) {
            Some((
                self.target_kbps.load(Ordering::Relaxed),
                self.max_kbps.load(Ordering::Relaxed),
            ))
        } else {
            None
        }
    }
}

pub struct FfmpegStageFactory;

impl StageFactory for FfmpegStageFactory {
    fn build(
        &self,
        source: &SourceConfig,
        encoder: &EncoderConfig,
        stats: Arc<Telemetry>,
    ) -> Result<Box<dyn TranscodeStage>, StageError> {
        let chain = TranscodeChain::open(source, encoder)?;
        Ok(Box::new(FfmpegStage {
            chain: Some(chain),
            stats,
            cancel: CancellationToken::new(),
            fault: Arc::new(Mutex::new(None)),
            bitrate: Arc::new(BitrateRequest::new()),
            done: None,
        }))
    }
}

pub struct FfmpegStage {
    chain: Option<TranscodeChain>,
    stats: Arc<Telemetry>,
    cancel: CancellationToken,
    fault: Arc<Mutex<Option<StageFault>>>,
    bitrate: Arc<BitrateRequest>,
    /// Disconnects when the chain thread has fully exited.
    done: Option<std::sync::mpsc::Receiver<()>>,
}

impl TranscodeStage for FfmpegStage {
    fn activate(&mut self) -> Result<UnitReceiver, StageError> {
        let chain = self
            .chain
            .take()
            .ok_or_else(|| StageError::Activate(anyhow::anyhow!("stage already activated")))?;

        let (tx, rx) = tokio::sync::mpsc::channel(UNIT_CHANNEL_CAP);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let cancel = self.cancel.clone();
        let fault = Arc::clone(&self.fault);
        let bitrate = Arc::clone(&self.bitrate);
        let stats = Arc::clone(&self.stats);
        tokio::task::spawn_blocking(move || {
            // Held for the whole run; the receiver disconnects when the
            // chain thread is gone, however it exits.
            let _done = done_tx;
            chain.run(tx, cancel, fault, bitrate, stats)
        });
        self.done = Some(done_rx);
        Ok(rx)
    }

    fn update_bitrate(&self, target_kbps: u32, max_kbps: u32) {
        self.bitrate.publish(target_kbps, max_kbps);
    }

    fn take_fault(&self) -> Option<StageFault> {
        self.fault.lock().unwrap().take()
    }

    fn teardown(mut self: Box<Self>) {
        self.cancel.cancel();
        // Wait for the chain thread to actually exit: a restart must never
        // leave a previous chain alive to stamp telemetry into the next
        // run's watchdog clock.
        if let Some(done) = self.done.take() {
            match done.recv_timeout(TEARDOWN_WAIT) {
                Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "transcode chain did not stop within {:?}",
                        TEARDOWN_WAIT
                    );
                }
            }
        }
    }
}

impl Drop for FfmpegStage {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Software scaler handle. The ffmpeg context holds raw pointers but is only
/// ever touched from the chain thread.
struct Scaler(ffmpeg_next::software::scaling::Context);

unsafe impl Send for Scaler {}

/// Hardware-first encoder lookup with software fallback.
fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

struct TranscodeChain {
    input: ffmpeg_next::format::context::Input,
    video_index: usize,
    stream_time_base: Rational,
    decoder: ffmpeg_next::codec::decoder::Video,
    decoder_time_base: Rational,
    encoder: ffmpeg_next::codec::encoder::Video,
    scaler: Option<Scaler>,
    frame_index: i64,
}

impl TranscodeChain {
    fn open(source: &SourceConfig, settings: &EncoderConfig) -> Result<Self, StageError> {
        let input = Self::open_input(source)?;

        let (video_index, stream_time_base, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg_next::media::Type::Video)
                .ok_or_else(|| {
                    StageError::build(
                        StagePart::Acquisition,
                        anyhow::anyhow!("no video stream in {}", source.url),
                    )
                })?;
            (stream.index(), stream.time_base(), stream.parameters())
        };

        let decoder = ffmpeg_next::codec::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| StageError::build(StagePart::Decode, e))?;
        if decoder.format() == ffmpeg_next::format::Pixel::None
            || decoder.width() == 0
            || decoder.height() == 0
        {
            return Err(StageError::build(
                StagePart::Decode,
                anyhow::anyhow!("missing codec parameters"),
            ));
        }
        let decoder_time_base = decoder.time_base();

        let encoder = Self::open_encoder(settings)
            .map_err(|e| StageError::build(StagePart::Encode, e))?;

        Ok(Self {
            input,
            video_index,
            stream_time_base,
            decoder,
            decoder_time_base,
            encoder,
            scaler: None,
            frame_index: 0,
        })
    }

    fn open_input(source: &SourceConfig) -> Result<ffmpeg_next::format::context::Input, StageError> {
        let mut last_err = None;
        for attempt in 0..=source.retry_count {
            let mut opts = Dictionary::new();
            opts.set("rtsp_transport", &source.transport);
            // stimeout/max_delay are microseconds
            opts.set("stimeout", &(source.tcp_timeout_ms * 1000).to_string());
            opts.set("max_delay", &(source.latency_ms as u64 * 1000).to_string());

            match ffmpeg_next::format::input_with_dictionary(&source.url, opts) {
                Ok(input) => return Ok(input),
                Err(e) => {
                    log::warn!(
                        "open {} failed (attempt {}/{}): {}",
                        source.url,
                        attempt + 1,
                        source.retry_count + 1,
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(StageError::build(
            StagePart::Acquisition,
            last_err.map(anyhow::Error::from).unwrap_or_else(|| {
                anyhow::anyhow!("open {} failed", source.url)
            }),
        ))
    }

    fn open_encoder(settings: &EncoderConfig) -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
        let open_with = |codec: ffmpeg_next::Codec,
                         settings: &EncoderConfig|
         -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
            let is_hw = codec.name() != "libx264";
            let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
                .encoder()
                .video()?;
            encoder.set_width(settings.width);
            encoder.set_height(settings.height);
            encoder.set_format(if is_hw {
                ffmpeg_next::format::Pixel::NV12
            } else {
                ffmpeg_next::format::Pixel::YUV420P
            });
            encoder.set_time_base(Rational(1, settings.framerate as i32));
            encoder.set_frame_rate(Some(Rational(settings.framerate as i32, 1)));
            encoder.set_gop(settings.idr_interval);
            encoder.set_bit_rate(settings.target_bitrate_kbps as usize * 1000);
            encoder.set_max_bit_rate(settings.max_bitrate_kbps as usize * 1000);
            if settings.control_rate == "cbr" {
                unsafe {
                    let ptr = encoder.as_mut_ptr();
                    (*ptr).rc_min_rate = settings.target_bitrate_kbps as i64 * 1000;
                    (*ptr).rc_buffer_size = settings.max_bitrate_kbps as i32 * 1000;
                }
            }

            let mut opts = Dictionary::new();
            opts.set("preset", &settings.preset);
            opts.set("profile", &settings.profile);
            opts.set("tune", "zerolatency");
            Ok(encoder.open_with(opts)?)
        };

        if let Some(hw_codec) = find_hw_encoder("h264") {
            let hw_name = hw_codec.name().to_string();
            match open_with(hw_codec, settings) {
                Ok(encoder) => {
                    log::info!("encoder opened: {}", hw_name);
                    return Ok(encoder);
                }
                Err(e) => {
                    log::warn!("hardware encoder {} failed: {}, falling back", hw_name, e);
                }
            }
        }

        let sw_codec = ffmpeg_next::encoder::find_by_name("libx264")
            .ok_or_else(|| anyhow::anyhow!("codec not found: libx264"))?;
        let encoder = open_with(sw_codec, settings)?;
        log::info!("encoder opened: libx264");
        Ok(encoder)
    }

    /// Runtime bitrate change, no rebuild. nvenc/x264 pick the new rates up
    /// from the next rate-control window.
    fn apply_bitrate(&mut self, target_kbps: u32, max_kbps: u32) {
        unsafe {
            let ptr = self.encoder.as_mut_ptr();
            (*ptr).bit_rate = target_kbps as i64 * 1000;
            (*ptr).rc_max_rate = max_kbps as i64 * 1000;
        }
        log::info!("bitrate updated: target={}kbps max={}kbps", target_kbps, max_kbps);
    }

    fn run(
        mut self,
        tx: UnitSender,
        cancel: CancellationToken,
        fault: Arc<Mutex<Option<StageFault>>>,
        bitrate: Arc<BitrateRequest>,
        stats: Arc<Telemetry>,
    ) {
        log::info!("transcode chain started");
        let mut dropped: u64 = 0;
        let outcome = loop {
            if cancel.is_cancelled() {
                break None;
            }
            if let Some((target, max)) = bitrate.take() {
                self.apply_bitrate(target, max);
            }

            let (index, mut packet) = match self.input.packets().next() {
                Some((stream, packet)) => (stream.index(), packet),
                None => break Some(StageFault::EndOfStream),
            };
            if index != self.video_index {
                continue;
            }

            packet.rescale_ts(self.stream_time_base, self.decoder_time_base);
            if let Err(e) = self.decoder.send_packet(&packet) {
                // A corrupt access unit is survivable; the stream recovers
                // at the next keyframe.
                log::warn!("decoder send_packet: {}", e);
                continue;
            }

            match self.drain_decoder(&tx, &stats, &mut dropped) {
                Ok(true) => {}
                Ok(false) => break None, // receiver gone, teardown under way
                Err(fault) => break Some(fault),
            }
        };

        if let Some(f) = outcome {
            log::error!("transcode chain fault: {}", f);
            *fault.lock().unwrap() = Some(f);
        }
        log::info!("transcode chain stopped");
    }

    /// Drain decoded frames, encode them, push produced units. Returns
    /// Ok(false) when the unit receiver is gone.
    fn drain_decoder(
        &mut self,
        tx: &UnitSender,
        stats: &Telemetry,
        dropped: &mut u64,
    ) -> Result<bool, StageFault> {
        loop {
            let mut frame = ffmpeg_next::frame::Video::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    if !self.encode_frame(frame, tx, stats, dropped)? {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(true);
                }
                Err(ffmpeg_next::Error::Eof) => return Err(StageFault::EndOfStream),
                Err(e) => return Err(StageFault::Error(format!("decode: {}", e))),
            }
        }
    }

    fn encode_frame(
        &mut self,
        frame: ffmpeg_next::frame::Video,
        tx: &UnitSender,
        stats: &Telemetry,
        dropped: &mut u64,
    ) -> Result<bool, StageFault> {
        let needs_scale = frame.format() != self.encoder.format()
            || frame.width() != self.encoder.width()
            || frame.height() != self.encoder.height();

        let mut sending = if needs_scale {
            // Transform stage is late-bound: the source format is only known
            // once the first frame arrives.
            let scaler = match &mut self.scaler {
                Some(scaler) => scaler,
                None => {
                    let context = ffmpeg_next::software::scaling::Context::get(
                        frame.format(),
                        frame.width(),
                        frame.height(),
                        self.encoder.format(),
                        self.encoder.width(),
                        self.encoder.height(),
                        ffmpeg_next::software::scaling::flag::Flags::BILINEAR,
                    )
                    .map_err(|e| StageFault::Error(format!("transform: {}", e)))?;
                    log::info!(
                        "transform: {:?} {}x{} -> {:?} {}x{}",
                        frame.format(),
                        frame.width(),
                        frame.height(),
                        self.encoder.format(),
                        self.encoder.width(),
                        self.encoder.height()
                    );
                    self.scaler.insert(Scaler(context))
                }
            };
            let mut converted = ffmpeg_next::frame::Video::empty();
            scaler
                .0
                .run(&frame, &mut converted)
                .map_err(|e| StageFault::Error(format!("transform: {}", e)))?;
            converted
        } else {
            frame
        };

        sending.set_pts(Some(self.frame_index));
        self.frame_index += 1;
        self.encoder
            .send_frame(&sending)
            .map_err(|e| StageFault::Error(format!("encode: {}", e)))?;

        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let unit = ProducedUnit {
                        data: packet.data().map(Bytes::copy_from_slice).unwrap_or_default(),
                        pts: packet.pts(),
                        is_key: packet.is_key(),
                    };
                    stats.on_unit();
                    match tx.try_send(unit) {
                        Ok(()) => {}
                        Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                            *dropped += 1;
                            if *dropped % 120 == 1 {
                                log::debug!("unit channel full, dropped {} units", dropped);
                            }
                        }
                        Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                            return Ok(false);
                        }
                    }
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(true);
                }
                Err(ffmpeg_next::Error::Eof) => return Err(StageFault::EndOfStream),
                Err(e) => return Err(StageFault::Error(format!("encode: {}", e))),
            }
        }
    }
}

#[cfg(test)]
#[path = "ffmpeg_test.rs"]
mod ffmpeg_test;
