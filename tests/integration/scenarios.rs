//! End-to-end coordinator scenarios against fake CI, relay and push stream.
//!
//! All tests run on a paused clock, so deadlines elapse as soon as every
//! task is idle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use testrelay::backend::PushMessage;
use testrelay::channels::simulated::{synthesize, SIMULATED_LOGS};
use testrelay::journal::{ExecutionJournal, JournalEventKind};
use testrelay::{
    ChannelKind, Delivery, ExecutionCoordinator, ExecutionMode, ExecutionOptions,
    ExecutionOutcome, ExecutionState, InMemoryRecordStore, RequestId, SubjectId, SubscriptionKey,
    TestResult, TestStatus, TimeoutConfig,
};

use crate::support::{ids, push, FakeBackend, FakeCi, ScriptedPush};

fn ci_options() -> ExecutionOptions {
    ExecutionOptions::new().with_mode(ExecutionMode::Ci)
}

fn transitions(journal: &ExecutionJournal, id: &RequestId) -> Vec<ExecutionState> {
    journal
        .store()
        .events(id)
        .unwrap()
        .into_iter()
        .filter_map(|event| match event.kind {
            JournalEventKind::Transition { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_results_from_push_and_backend_are_reconciled_once() {
    let store = Arc::new(InMemoryRecordStore::new());
    let ci = Arc::new(FakeCi::stalled());
    let backend = Arc::new(FakeBackend::healthy());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(ci.clone())
        .with_backend(backend.clone())
        .with_push_source(Arc::new(source))
        .with_callback_url("http://relay.test/api/webhook/results")
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(60))
                .with_backend_poll_interval(Duration::from_secs(5)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let progress = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&progress);
    coordinator.on_progress(&handle, move |results| {
        seen.fetch_add(results.len(), Ordering::SeqCst);
    });

    let id = handle.request_id().clone();
    pushes
        .send(push(&id, vec![TestResult::new("TC_001", TestStatus::Passed)]))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.get("TC_001").map(|tc| tc.status), Some(TestStatus::Passed));
    assert_eq!(store.mutation_count(), 1);
    let summary = coordinator.summary(&id).unwrap();
    assert_eq!(summary.state, ExecutionState::AwaitingResults);
    assert_eq!(summary.count(TestStatus::Passed), 1);

    // The same terminal status again, from both channels.
    pushes
        .send(push(&id, vec![TestResult::new("TC_001", TestStatus::Passed)]))
        .unwrap();
    backend.store(vec![
        TestResult::new("TC_001", TestStatus::Passed),
        TestResult::new("TC_002", TestStatus::Failed),
    ]);

    let report = handle.wait().await;
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.status_of("TC_001"), Some(TestStatus::Passed));
    assert_eq!(report.status_of("TC_002"), Some(TestStatus::Failed));
    assert!(report.unresolved.is_empty());
    assert_eq!(store.mutation_count(), 2);
    assert_eq!(progress.load(Ordering::SeqCst), 2);

    let dispatched = ci.dispatched.lock().unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].request_id, id);
    assert_eq!(
        dispatched[0].callback_url.as_deref(),
        Some("http://relay.test/api/webhook/results")
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_never_reaches_store() {
    let store = Arc::new(InMemoryRecordStore::new());
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_timeouts(
            TimeoutConfig::default()
                .with_simulation_delay(Duration::from_secs(10))
                .with_result_grace(Duration::from_secs(30)),
        )
        .build();

    let handle = coordinator
        .start(
            SubjectId::new("REQ-1"),
            ids(&["TC_001", "TC_002"]),
            ExecutionOptions::new().with_mode(ExecutionMode::Simulated),
        )
        .unwrap();
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    coordinator.on_complete(&handle, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(coordinator.cancel(&handle));
    let report = handle.wait().await;
    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert!(!coordinator.cancel(&handle));

    // Late deliveries inside the grace period are recognised and dropped.
    let id = handle.request_id().clone();
    let late = vec![TestResult::new("TC_001", TestStatus::Passed)];
    assert_eq!(
        coordinator.registry().deliver(&id, ChannelKind::Push, late.clone()),
        Delivery::Discarded
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(store.mutation_count(), 0);
    assert_eq!(
        coordinator.summary(&id).map(|s| s.state),
        Some(ExecutionState::Cancelled)
    );

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(
        coordinator.registry().deliver(&id, ChannelKind::Push, late),
        Delivery::Unknown
    );
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_all_channels_failing_times_out() {
    let store = Arc::new(InMemoryRecordStore::new());
    let ci = Arc::new(FakeCi::stalled());
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(ci.clone())
        .with_backend(Arc::new(FakeBackend::flaky()))
        .with_push_source(Arc::new(ScriptedPush::refusing()))
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(30))
                .with_outer_deadline(Duration::from_secs(120))
                .with_backend_retry(2, Duration::from_millis(100)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let report = handle.wait().await;

    assert_eq!(report.outcome, ExecutionOutcome::TimedOut);
    assert_eq!(report.unresolved, vec!["TC_001", "TC_002"]);
    assert_eq!(store.mutation_count(), 0);
    assert!(ci.status_queries.load(Ordering::SeqCst) > 0);
    assert_eq!(
        coordinator.summary(handle.request_id()).map(|s| s.state),
        Some(ExecutionState::TimedOut)
    );
}

#[tokio::test(start_paused = true)]
async fn test_backend_unavailable_falls_back_to_ci_polling() {
    let dir = tempfile::tempdir().unwrap();
    let journal = ExecutionJournal::open(dir.path()).unwrap();
    let store = Arc::new(InMemoryRecordStore::new());
    let ci = Arc::new(FakeCi::completing(
        0,
        r#"{"results":[{"testCaseId":"TC_001","status":"passed","duration":1200},{"testCaseId":"TC_002","status":"failed"}]}"#,
    ));
    let backend = Arc::new(FakeBackend::unavailable());
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(ci)
        .with_backend(backend.clone())
        .with_journal(journal.clone())
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(5))
                .with_ci_poll_interval(Duration::from_secs(10)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-7"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let id = handle.request_id().clone();

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(
        coordinator.summary(&id).map(|s| s.state),
        Some(ExecutionState::Polling)
    );

    let report = handle.wait().await;
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.status_of("TC_001"), Some(TestStatus::Passed));
    assert_eq!(report.status_of("TC_002"), Some(TestStatus::Failed));
    assert_eq!(store.get("TC_001").map(|tc| tc.duration_ms), Some(Some(1200)));
    assert_eq!(backend.queries.load(Ordering::SeqCst), 0);

    assert_eq!(
        transitions(&journal, &id),
        vec![
            ExecutionState::Dispatching,
            ExecutionState::AwaitingResults,
            ExecutionState::Polling,
            ExecutionState::Completed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_simulated_run_is_deterministic() {
    let store = Arc::new(InMemoryRecordStore::new());
    let coordinator = ExecutionCoordinator::builder(store.clone()).build();

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    coordinator.subscribe(
        SubscriptionKey::Subject(SubjectId::new("REQ-9")),
        Arc::new(move |_: &RequestId, channel: ChannelKind, results: &[TestResult]| {
            assert_eq!(channel, ChannelKind::Simulated);
            counter.fetch_add(results.len(), Ordering::SeqCst);
        }),
    );

    let handle = coordinator
        .start(SubjectId::new("REQ-9"), ids(&["TC_001", "TC_002"]), ExecutionOptions::new())
        .unwrap();
    let report = handle.wait().await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    for result in &report.results {
        let expected = synthesize(handle.request_id(), &result.test_case_id);
        assert_eq!(result.status, expected.status);
        assert_eq!(result.duration_ms, expected.duration_ms);
        let record = store.get(&result.test_case_id).unwrap();
        assert_eq!(record.logs.as_deref(), Some(SIMULATED_LOGS));
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(store.recalculation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_supersedes_first() {
    let store = Arc::new(InMemoryRecordStore::new());
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_timeouts(TimeoutConfig::default().with_simulation_delay(Duration::from_secs(10)))
        .build();
    let options = ExecutionOptions::new().with_mode(ExecutionMode::Simulated);

    let first = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001"]), options.clone())
        .unwrap();
    let first_completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&first_completions);
    coordinator.on_complete(&first, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let second = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001", "TC_002"]), options)
        .unwrap();

    let first_report = first.wait().await;
    assert_eq!(
        first_report.outcome,
        ExecutionOutcome::Superseded {
            by: second.request_id().clone()
        }
    );
    assert_eq!(
        coordinator.registry().resolve_subject(&SubjectId::new("REQ-1")),
        Some(second.request_id().clone())
    );

    let second_report = second.wait().await;
    assert_eq!(second_report.outcome, ExecutionOutcome::Completed);
    assert_eq!(first_completions.load(Ordering::SeqCst), 1);
    assert_eq!(store.mutation_count(), 2);
    assert_eq!(coordinator.registry().resolve_subject(&SubjectId::new("REQ-1")), None);
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_is_retried_with_next_batch() {
    let store = Arc::new(InMemoryRecordStore::new());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::stalled()))
        .with_backend(Arc::new(FakeBackend::healthy()))
        .with_push_source(Arc::new(source))
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let id = handle.request_id().clone();

    store.set_unavailable(true);
    pushes
        .send(push(&id, vec![TestResult::new("TC_001", TestStatus::Passed)]))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(store.get("TC_001").is_none());

    store.set_unavailable(false);
    pushes
        .send(push(&id, vec![TestResult::new("TC_002", TestStatus::Blocked)]))
        .unwrap();
    let report = handle.wait().await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(store.get("TC_001").map(|tc| tc.status), Some(TestStatus::Passed));
    assert_eq!(store.get("TC_002").map(|tc| tc.status), Some(TestStatus::Blocked));
    assert_eq!(store.mutation_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_subject_only_push_routes_to_active_request() {
    let store = Arc::new(InMemoryRecordStore::new());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::stalled()))
        .with_backend(Arc::new(FakeBackend::healthy()))
        .with_push_source(Arc::new(source))
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-42"), ids(&["TC_001"]), ci_options())
        .unwrap();
    pushes
        .send(Ok(PushMessage {
            request_id: None,
            subject_id: Some(SubjectId::new("REQ-42")),
            results: vec![TestResult::new("TC_001", TestStatus::Passed)],
        }))
        .unwrap();

    let report = handle.wait().await;
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(store.get("TC_001").map(|tc| tc.status), Some(TestStatus::Passed));
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_across_push_and_backend_completes_once() {
    let store = Arc::new(InMemoryRecordStore::new());
    let backend = Arc::new(FakeBackend::healthy());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::stalled()))
        .with_backend(backend.clone())
        .with_push_source(Arc::new(source))
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(60))
                .with_backend_poll_interval(Duration::from_secs(5)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-3"), ids(&["A", "B", "C"]), ci_options())
        .unwrap();
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    coordinator.on_complete(&handle, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let id = handle.request_id().clone();

    pushes
        .send(push(&id, vec![TestResult::new("B", TestStatus::Passed)]))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let summary = coordinator.summary(&id).unwrap();
    assert_eq!(summary.count(TestStatus::Passed), 1);
    assert!(summary.active_channels.contains(&ChannelKind::Push));
    assert!(summary.active_channels.contains(&ChannelKind::BackendPoll));

    backend.store(vec![TestResult::new("A", TestStatus::Failed)]);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(store.get("A").map(|tc| tc.status), Some(TestStatus::Failed));
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    pushes
        .send(push(&id, vec![TestResult::new("C", TestStatus::Passed)]))
        .unwrap();
    let report = handle.wait().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.status_of("A"), Some(TestStatus::Failed));
    assert_eq!(report.status_of("B"), Some(TestStatus::Passed));
    assert_eq!(report.status_of("C"), Some(TestStatus::Passed));
    assert_eq!(store.mutation_count(), 3);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    let summary = coordinator.summary(&id).unwrap();
    assert!(summary.active_channels.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_final_results_are_written_once_store_recovers() {
    let store = Arc::new(InMemoryRecordStore::new());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::stalled()))
        .with_backend(Arc::new(FakeBackend::healthy()))
        .with_push_source(Arc::new(source))
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001"]), ci_options())
        .unwrap();
    let id = handle.request_id().clone();

    store.set_unavailable(true);
    pushes
        .send(push(&id, vec![TestResult::new("TC_001", TestStatus::Passed)]))
        .unwrap();
    let recovering = Arc::clone(&store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(20)).await;
        recovering.set_unavailable(false);
    });

    let report = handle.wait().await;
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.unreconciled.is_empty());
    assert_eq!(store.get("TC_001").map(|tc| tc.status), Some(TestStatus::Passed));
    assert_eq!(store.mutation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_final_results_fail_the_request() {
    let store = Arc::new(InMemoryRecordStore::new());
    let (source, pushes) = ScriptedPush::new();
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::stalled()))
        .with_backend(Arc::new(FakeBackend::healthy()))
        .with_push_source(Arc::new(source))
        .with_timeouts(
            TimeoutConfig::default()
                .with_outer_deadline(Duration::from_secs(60))
                .with_result_grace(Duration::from_secs(5)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-1"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let id = handle.request_id().clone();

    store.set_unavailable(true);
    pushes
        .send(push(
            &id,
            vec![
                TestResult::new("TC_001", TestStatus::Passed),
                TestResult::new("TC_002", TestStatus::Failed),
            ],
        ))
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = handle.wait().await;
    assert!(started.elapsed() >= Duration::from_secs(55));

    match &report.outcome {
        ExecutionOutcome::Failed { reason } => {
            assert!(reason.contains("TC_001"), "reason: {}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.unreconciled, vec!["TC_001", "TC_002"]);
    assert!(report.unresolved.is_empty());
    assert_eq!(store.mutation_count(), 0);
    assert_eq!(
        coordinator.summary(&id).map(|s| s.state),
        Some(ExecutionState::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_ci_errors_fail_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let journal = ExecutionJournal::open(dir.path()).unwrap();
    let ci = Arc::new(FakeCi::unreachable());
    let coordinator = ExecutionCoordinator::builder(Arc::new(InMemoryRecordStore::new()))
        .with_ci(ci.clone())
        .with_backend(Arc::new(FakeBackend::unavailable()))
        .with_journal(journal.clone())
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(5))
                .with_ci_poll_interval(Duration::from_secs(10))
                .with_ci_max_consecutive_errors(3),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-5"), ids(&["TC_001"]), ci_options())
        .unwrap();
    let report = handle.wait().await;

    match &report.outcome {
        ExecutionOutcome::Failed { reason } => {
            assert!(reason.contains("3 consecutive failures"), "reason: {}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.unresolved, vec!["TC_001"]);
    assert_eq!(ci.status_queries.load(Ordering::SeqCst), 3);
    assert_eq!(
        transitions(&journal, handle.request_id()),
        vec![
            ExecutionState::Dispatching,
            ExecutionState::AwaitingResults,
            ExecutionState::Polling,
            ExecutionState::Failed,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_artifact_fails_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let journal = ExecutionJournal::open(dir.path()).unwrap();
    let store = Arc::new(InMemoryRecordStore::new());
    let coordinator = ExecutionCoordinator::builder(store.clone())
        .with_ci(Arc::new(FakeCi::completing(1, "<html>not results</html>")))
        .with_backend(Arc::new(FakeBackend::unavailable()))
        .with_journal(journal.clone())
        .with_timeouts(
            TimeoutConfig::default()
                .with_primary_wait(Duration::from_secs(5))
                .with_ci_poll_interval(Duration::from_secs(10)),
        )
        .build();

    let handle = coordinator
        .start(SubjectId::new("REQ-6"), ids(&["TC_001", "TC_002"]), ci_options())
        .unwrap();
    let report = handle.wait().await;

    match &report.outcome {
        ExecutionOutcome::Failed { reason } => {
            assert!(reason.starts_with("artifact error"), "reason: {}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.unresolved, vec!["TC_001", "TC_002"]);
    assert_eq!(store.mutation_count(), 0);
    assert_eq!(
        transitions(&journal, handle.request_id()),
        vec![
            ExecutionState::Dispatching,
            ExecutionState::AwaitingResults,
            ExecutionState::Polling,
            ExecutionState::Failed,
        ]
    );
}
