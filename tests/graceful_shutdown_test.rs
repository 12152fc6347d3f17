//! Tests for graceful shutdown with long waits in flight.

use stamina_ia::actors::{SweepConfig, SweepController, SweepPhase};
use stamina_ia::app::InitialAccess;
use stamina_ia::config::Settings;
use stamina_ia::core::{BeamIndex, RoleAssignment};
use stamina_ia::hardware::{BeamMapper, GpioLayout};
use std::time::{Duration, Instant};

const GPIO_MAP: &str = r#"{
  "beam_range": {"lower": 0, "upper": 5},
  "id_range": {"lower": 6, "upper": 7},
  "mode_range": {"lower": 8, "upper": 9},
  "radio_id": {"1": 6, "2": 7},
  "radio_mode": {"1": 8, "2": 9}
}"#;

fn mapper() -> BeamMapper {
    let document: serde_json::Value = serde_json::from_str(GPIO_MAP).unwrap();
    BeamMapper::new(
        RoleAssignment::parse("MHU1", "MHU2").unwrap(),
        GpioLayout::from_document(&document).unwrap(),
        Duration::from_micros(2),
        Duration::from_micros(2),
    )
}

fn beams(raw: &[u8]) -> Vec<BeamIndex> {
    raw.iter().map(|&b| BeamIndex::new(i64::from(b)).unwrap()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_shutdown_interrupts_long_dwell() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.application.log_dir = dir.path().to_path_buf();
    settings.sweep.beam_period = Duration::from_secs(3600);

    let mut ia = InitialAccess::with_mapper(&settings, mapper()).unwrap();
    ia.start().unwrap();
    let mut status = ia.sweep_status();
    status
        .wait_for(|s| s.phase == SweepPhase::Sweeping)
        .await
        .unwrap();

    let start = Instant::now();
    ia.stop().await.unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(1),
        "Shutdown took too long: {:?}",
        elapsed
    );
    assert!(!status.borrow().running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_while_waiting_for_missing_selection() {
    // Nobody answers the stop trigger.
    let mut sweep = SweepController::new(SweepConfig {
        tx_beams: beams(&[1]),
        rx_beams: beams(&[1]),
        beam_period: Duration::from_millis(5),
        interval: Duration::from_secs(3600),
        standalone: false,
        selection_timeout: None,
    })
    .unwrap();
    let mut status = sweep.status();
    sweep.start().unwrap();
    status
        .wait_for(|s| s.phase == SweepPhase::AwaitingSelection)
        .await
        .unwrap();

    let start = Instant::now();
    sweep.stop().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(status.borrow().phase, SweepPhase::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logs_are_flushed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.application.log_dir = dir.path().to_path_buf();
    settings.application.file_suffix = "sd".into();
    settings.sweep.beam_period = Duration::from_millis(5);
    settings.sweep.tx_beams = vec![1, 2];
    settings.sweep.rx_beams = vec![3];

    let mut ia = InitialAccess::with_mapper(&settings, mapper()).unwrap();
    ia.start().unwrap();
    let mut outcome = ia.selection_outcome();
    outcome.wait_for(|o| o.is_some()).await.unwrap();
    ia.stop().await.unwrap();

    let files = settings.log_files();
    let beam_log = std::fs::read_to_string(&files.beam).unwrap();
    let rows: Vec<&str> = beam_log.lines().skip(1).collect();
    assert!(rows.len() >= 2);
    assert!(rows[0].ends_with(",1,3"));
    assert!(rows[1].ends_with(",2,3"));
    let selection_log = std::fs::read_to_string(&files.selection).unwrap();
    assert_eq!(selection_log.lines().count(), 2);
}
