mod common;

use std::time::Duration;

use vehicle_relay::{RegistryError, SessionState, Termination};

use common::{registry, wait_until};

#[test]
fn duplicate_id_is_rejected_while_active() {
    let registry = registry();
    registry.start("cam1", "stub://cam1", None).unwrap();
    let err = registry.start("cam1", "stub://other", None).unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateSession(id) if id == "cam1"));
    registry.stop("cam1").unwrap();
}

#[test]
fn stop_removes_session_and_id_can_be_reused() {
    let registry = registry();
    let first = registry.start("cam1", "stub://cam1", None).unwrap();
    registry.stop("cam1").unwrap();
    assert_eq!(first.state(), SessionState::Stopped);
    assert_eq!(first.termination(), Some(Termination::Stopped));
    assert!(matches!(
        registry.get("cam1"),
        Err(RegistryError::SessionNotFound(_))
    ));
    assert!(matches!(
        registry.stop("cam1"),
        Err(RegistryError::SessionNotFound(_))
    ));

    let second = registry.start("cam1", "stub://cam1", None).unwrap();
    assert_eq!(second.state(), SessionState::Running);
    registry.stop("cam1").unwrap();
}

#[test]
fn unknown_ids_report_not_found() {
    let registry = registry();
    assert!(matches!(
        registry.stats("ghost"),
        Err(RegistryError::SessionNotFound(_))
    ));
    assert!(matches!(
        registry.latest_frame("ghost", Some(Duration::from_millis(1))),
        Err(RegistryError::SessionNotFound(_))
    ));
}

#[test]
fn stats_match_latest_snapshot() {
    let registry = registry();
    let session = registry.start("lot", "stub://lot", None).unwrap();
    let frame = registry
        .latest_frame("lot", Some(Duration::from_secs(2)))
        .unwrap()
        .expect("frame within timeout");
    assert_eq!(frame.current_count(), frame.current_ids().len());
    assert_eq!(frame.total_count(), 1);

    let stats = registry.stats("lot").unwrap();
    assert_eq!(stats.total_count, 1);
    assert_eq!(stats.current_count, session.current_ids().len());
    registry.stop("lot").unwrap();
}

#[test]
fn exhausted_source_ends_session_and_slot_is_reaped() {
    let registry = registry();
    let session = registry
        .start("clip", "stub://clip?frames=10&fps=0", None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_active()));
    assert_eq!(session.termination(), Some(Termination::SourceEnded));
    assert_eq!(session.frames_processed(), 10);

    // The stopped session stays visible until replaced or stopped.
    let info = registry.info("clip").unwrap();
    assert_eq!(info.state, SessionState::Stopped);

    let replacement = registry.start("clip", "stub://clip", None).unwrap();
    assert_eq!(replacement.state(), SessionState::Running);
    registry.stop("clip").unwrap();
}

#[test]
fn stopping_an_ended_session_succeeds() {
    let registry = registry();
    let session = registry
        .start("short", "stub://short?frames=1&fps=0", None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_active()));
    registry.stop("short").unwrap();
    assert!(registry.is_empty());
    assert_eq!(session.termination(), Some(Termination::SourceEnded));
}

#[test]
fn failing_source_is_reported() {
    let registry = registry();
    let session = registry
        .start("flaky", "stub://flaky?fail_after=3&fps=0", None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_active()));
    assert!(matches!(
        session.termination(),
        Some(Termination::SourceFailed(_))
    ));
}

#[test]
fn bad_source_fails_start_without_registering() {
    let registry = registry();
    let err = registry
        .start("bad", "stub://bad?frames=lots", None)
        .unwrap_err();
    assert!(matches!(err, RegistryError::Start(_)));
    assert!(registry.get("bad").is_err());
}

#[test]
fn sessions_run_independently() {
    let registry = registry();
    registry.start("a", "stub://a", None).unwrap();
    registry.start("b", "stub://b", None).unwrap();
    assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);

    registry.stop("a").unwrap();
    let frame = registry
        .latest_frame("b", Some(Duration::from_secs(2)))
        .unwrap();
    assert!(frame.is_some());

    registry.stop_all();
    assert!(registry.is_empty());
}

#[cfg(unix)]
#[test]
fn decoder_exit_failure_is_reported_as_source_failure() {
    let mut settings = common::small_settings();
    settings.ingest.ffmpeg = "/bin/false".to_string();
    let registry = vehicle_relay::StreamRegistry::new(settings, common::parked_car_factory());

    let session = registry
        .start("remote", "rtsp://unreachable.invalid/stream", None)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || !session.is_active()));
    match session.termination() {
        Some(Termination::SourceFailed(reason)) => assert!(reason.contains("exit status")),
        other => panic!("unexpected termination {:?}", other),
    }
}
