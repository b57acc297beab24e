use std::time::Duration;

use super::Telemetry;

#[test]
fn test_clock_runs_before_first_unit() {
    let stats = Telemetry::new();
    stats.reset_run();
    std::thread::sleep(Duration::from_millis(50));
    let since = stats.seconds_since_last_unit();
    // No unit yet: reads as elapsed run time, not zero.
    assert!(since >= 0.04, "since = {}", since);
    assert!(since < 1.0, "since = {}", since);
}

#[test]
fn test_unit_stamps_clock() {
    let stats = Telemetry::new();
    stats.reset_run();
    std::thread::sleep(Duration::from_millis(30));
    stats.on_unit();
    let since = stats.seconds_since_last_unit();
    assert!(since < 0.03, "since = {}", since);
    assert_eq!(stats.frame_count(), 1);
}

#[test]
fn test_reset_run_keeps_process_counters() {
    let stats = Telemetry::new();
    stats.reset_run();
    stats.on_unit();
    stats.on_unit();
    stats.on_reconnect();
    stats.on_restart();

    stats.reset_run();
    assert_eq!(stats.frame_count(), 0);
    assert_eq!(stats.reconnect_count(), 1);
    assert_eq!(stats.restart_count(), 1);
}

#[test]
fn test_fps_window() {
    let stats = Telemetry::new();
    stats.reset_run();

    // First snapshot has no window yet.
    let first = stats.snapshot();
    assert_eq!(first.fps, 0.0);

    for _ in 0..10 {
        stats.on_unit();
    }
    std::thread::sleep(Duration::from_millis(100));
    let second = stats.snapshot();
    // 10 frames over ~0.1s, allow generous scheduling slack.
    assert!(second.fps > 20.0, "fps = {}", second.fps);
    assert!(second.fps <= 300.0, "fps = {}", second.fps);
    assert_eq!(second.frames, 10);
}

#[test]
fn test_uptime_is_per_run() {
    let stats = Telemetry::new();
    stats.reset_run();
    std::thread::sleep(Duration::from_millis(1100));
    assert!(stats.snapshot().uptime_s >= 1);

    // A restart re-stamps the run epoch; uptime starts over.
    stats.reset_run();
    assert_eq!(stats.snapshot().uptime_s, 0);
    assert_eq!(stats.peek().uptime_s, 0);
}

#[test]
fn test_snapshot_display_format() {
    let stats = Telemetry::new();
    stats.reset_run();
    stats.on_unit();
    let line = stats.snapshot().to_string();
    assert!(line.contains("uptime=00:00:0"), "line = {}", line);
    assert!(line.contains("frames=1"), "line = {}", line);
    assert!(line.contains("reconnects=0"), "line = {}", line);
}
