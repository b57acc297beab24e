use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{BitrateRequest, FfmpegStage, TEARDOWN_WAIT};
use crate::stage::TranscodeStage;
use crate::stats::Telemetry;

fn stage_with_done(done: std::sync::mpsc::Receiver<()>) -> Box<FfmpegStage> {
    Box::new(FfmpegStage {
        chain: None,
        stats: Arc::new(Telemetry::new()),
        cancel: CancellationToken::new(),
        fault: Arc::new(Mutex::new(None)),
        bitrate: Arc::new(BitrateRequest::new()),
        done: Some(done),
    })
}

#[test]
fn test_teardown_joins_chain_thread() {
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let stage = stage_with_done(done_rx);

    let cancel = stage.cancel.clone();
    let finished = Arc::new(AtomicBool::new(false));
    let thread_finished = Arc::clone(&finished);
    std::thread::spawn(move || {
        let _done = done_tx;
        while !cancel.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Tail of an in-flight iteration after the cancel was observed.
        std::thread::sleep(Duration::from_millis(50));
        thread_finished.store(true, Ordering::SeqCst);
    });

    stage.teardown();
    // teardown returned only after the thread ran to completion: nothing
    // of the old instance can touch shared telemetry any more.
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_teardown_wait_is_bounded() {
    let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
    let stage = stage_with_done(done_rx);

    // A wedged chain: holds the done sender well past the wait bound.
    std::thread::spawn(move || {
        let _done = done_tx;
        std::thread::sleep(Duration::from_secs(60));
    });

    let start = Instant::now();
    stage.teardown();
    assert!(start.elapsed() >= TEARDOWN_WAIT);
    assert!(start.elapsed() < TEARDOWN_WAIT + Duration::from_secs(5));
}
