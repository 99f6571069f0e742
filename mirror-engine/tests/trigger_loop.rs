mod common;

use common::{at, Harness};
use mirror_engine::naming::lock_name;
use mirror_engine::ports::NotificationLevel;
use mirror_engine::trigger::{self, LifecycleEvent};
use mirror_engine::{AttemptOutcome, MachineId, SyncStatus, TriggerLoop};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn session_marker_brackets_application_window() {
    let h = Harness::new();
    let orchestrator = Arc::new(h.orchestrator());
    let (_feed, rx) = trigger::channel();
    let mut triggers = TriggerLoop::new(orchestrator.clone(), rx);

    h.probe.set_running(true);
    assert!(triggers.handle(LifecycleEvent::SourceLaunched).await.is_none());
    assert_eq!(h.root_entries(), vec!["2024-06-01_1200_home.lockfile"]);

    h.probe.set_running(false);
    let outcome = triggers.handle(LifecycleEvent::SourceTerminated).await;
    assert!(matches!(outcome, Some(AttemptOutcome::Succeeded(_))));
    assert!(triggers.session().marker().is_none());
    assert_eq!(h.root_entries(), vec!["2024-06-01_1200_home"]);
}

#[tokio::test]
async fn session_conflict_is_reported() {
    let h = Harness::new();
    let laptop = MachineId::new("laptop").unwrap();
    h.touch(&lock_name(&laptop, at(2024, 6, 1, 11, 30)));

    let (_feed, rx) = trigger::channel();
    let mut triggers = TriggerLoop::new(Arc::new(h.orchestrator()), rx);
    triggers.handle(LifecycleEvent::SourceLaunched).await;

    let notes = h.notifier.all();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].code.as_deref(), Some("conflictDetected"));
    assert_eq!(notes[0].level, NotificationLevel::Warning);
    assert!(triggers.session().marker().is_some());
}

#[tokio::test]
async fn loop_processes_events_in_order_and_releases_session() {
    let h = Harness::new();
    let orchestrator = Arc::new(h.orchestrator());
    let (feed, rx) = trigger::channel();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(TriggerLoop::new(orchestrator.clone(), rx).run(cancel.clone()));

    let mut status = orchestrator.subscribe();
    feed.try_emit(LifecycleEvent::Startup).unwrap();
    status
        .wait_for(|s| s.last_attempt.is_some() && s.state == SyncStatus::Idle)
        .await
        .unwrap();

    feed.try_emit(LifecycleEvent::SourceLaunched).unwrap();
    drop(feed);
    handle.await.unwrap();

    // Feed closed: the loop exits and removes its session marker
    assert_eq!(h.root_entries(), vec!["2024-06-01_1200_home"]);
    let record = orchestrator.record().await.unwrap().unwrap();
    assert_eq!(record.total_syncs, 1);
    assert!(!cancel.is_cancelled());
}
