mod support;

use seggate::models::WorkItemState;
use seggate::relay::ResultRelay;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use support::{close_queue, drain, relay_with, session, settings, FakeInference, PollStep, RecordingTransfer};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const S1_FILES: &[(&str, &str)] = &[
    ("1.1", "CT"),
    ("1.2", "CT"),
    ("2.1", "RTSTRUCT"),
    ("1.3", "CT"),
    ("2.2", "RTSTRUCT"),
];

#[tokio::test]
async fn completed_result_is_relayed_back_and_archived() {
    let dir = TempDir::new().unwrap();
    let inference = FakeInference::new(vec![PollStep::Progress(40)], PollStep::Complete);
    let transfer = RecordingTransfer::new(0);
    let relay = relay_with(dir.path(), inference.clone(), transfer.clone(), settings(dir.path()));

    let item = relay.enqueue(session("S1", S1_FILES)).await.unwrap();
    assert_eq!(item.state, WorkItemState::Queued);
    assert_eq!(item.channels.len(), 2);
    assert_eq!(item.channels[0].channel_id(), "CT");
    assert_eq!(item.channels[0].files().len(), 3);
    assert_eq!(item.channels[1].files().len(), 2);

    // First pass submits and sees 40%
    assert!(relay.process_next("w0").await.unwrap());
    let waiting = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(waiting.state, WorkItemState::AwaitingResult);
    assert_eq!(waiting.progress, 40);
    assert!(waiting.run_id.is_some());
    assert!(waiting.claimed_by.is_none());

    drain(&relay, 50).await;

    assert!(relay.queue().get(&item.id).unwrap().is_none());
    let archived = relay.queue().get_archived(&item.id).unwrap().unwrap();
    assert_eq!(archived.state, WorkItemState::Archived);
    assert_eq!(archived.progress, 100);
    let result_path = archived.result_path.unwrap();
    assert!(result_path.starts_with(dir.path().join("results").join(&item.id)));

    let sent = transfer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].peer_aet, "MODALITY");
    assert_eq!(sent[0].peer_host, "10.20.30.40");
    assert_eq!(sent[0].peer_port, 104);
    assert_eq!(sent[0].files, vec![result_path]);
    assert_eq!(inference.submit_count(), 1);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn inference_error_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let inference = FakeInference::new(vec![PollStep::Error("bad input".into())], PollStep::Complete);
    let transfer = RecordingTransfer::new(0);
    let relay = relay_with(dir.path(), inference.clone(), transfer.clone(), settings(dir.path()));

    let item = relay.enqueue(session("S2", &[("1.1", "CT")])).await.unwrap();
    assert!(relay.process_next("w0").await.unwrap());

    let failed = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(failed.state, WorkItemState::Failed);
    assert!(failed.last_error.unwrap().contains("bad input"));
    assert_eq!(failed.retry_count, 0);

    // Parked for operators: never claimed again, never relayed
    assert!(!relay.process_next("w0").await.unwrap());
    assert_eq!(inference.poll_count(), 1);
    assert!(transfer.sent().is_empty());

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn progress_never_goes_backwards() {
    let dir = TempDir::new().unwrap();
    let inference = FakeInference::new(vec![PollStep::Progress(60), PollStep::Progress(30)], PollStep::Progress(30));
    let relay = relay_with(dir.path(), inference, RecordingTransfer::new(0), settings(dir.path()));

    let item = relay.enqueue(session("S3", &[("1.1", "CT")])).await.unwrap();
    relay.process_next("w0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    relay.process_next("w0").await.unwrap();

    let current = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(current.state, WorkItemState::AwaitingResult);
    assert_eq!(current.progress, 60);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn failed_relay_is_retried_with_backoff() {
    let dir = TempDir::new().unwrap();
    let transfer = RecordingTransfer::new(1);
    let relay = relay_with(dir.path(), FakeInference::instant(), transfer.clone(), settings(dir.path()));

    let item = relay.enqueue(session("S4", &[("1.1", "CT")])).await.unwrap();
    relay.process_next("w0").await.unwrap();

    let retrying = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(retrying.state, WorkItemState::Relaying);
    assert_eq!(retrying.retry_count, 1);
    assert!(retrying.last_error.unwrap().contains("association rejected"));
    assert!(retrying.not_before.is_some());

    drain(&relay, 50).await;
    let archived = relay.queue().get_archived(&item.id).unwrap().unwrap();
    assert_eq!(archived.state, WorkItemState::Archived);
    assert_eq!(transfer.sent().len(), 1);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn unreachable_model_server_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let inference = FakeInference::new(Vec::new(), PollStep::Unreachable);
    let relay = relay_with(dir.path(), inference.clone(), RecordingTransfer::new(0), settings(dir.path()));

    let item = relay.enqueue(session("S5", &[("1.1", "CT")])).await.unwrap();
    drain(&relay, 100).await;

    let failed = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(failed.state, WorkItemState::Failed);
    assert!(failed.last_error.unwrap().contains("Retries exhausted"));
    assert_eq!(inference.poll_count(), 3);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn result_timeout_fails_the_item() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.result_timeout = Duration::ZERO;
    let inference = FakeInference::new(Vec::new(), PollStep::Progress(10));
    let relay = relay_with(dir.path(), inference.clone(), RecordingTransfer::new(0), settings);

    let item = relay.enqueue(session("S6", &[("1.1", "CT")])).await.unwrap();
    relay.process_next("w0").await.unwrap();

    let failed = relay.queue().get(&item.id).unwrap().unwrap();
    assert_eq!(failed.state, WorkItemState::Failed);
    assert!(failed.last_error.unwrap().contains("did not finish"));
    assert_eq!(inference.poll_count(), 0);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn missing_required_channel_is_recorded_as_failed() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.required_channels = vec!["CT".into(), "MR".into()];
    let inference = FakeInference::instant();
    let relay = relay_with(dir.path(), inference.clone(), RecordingTransfer::new(0), settings);

    let item = relay.enqueue(session("S7", &[("1.1", "CT")])).await.unwrap();
    assert_eq!(item.state, WorkItemState::Failed);
    assert!(item.last_error.unwrap().contains("MR"));
    assert!(!relay.process_next("w0").await.unwrap());
    assert_eq!(inference.submit_count(), 0);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn configured_destination_overrides_sender() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    settings.destination = Some(dimse::RemoteNode::new("PACS", "pacs.local", 11112));
    let transfer = RecordingTransfer::new(0);
    let relay = relay_with(dir.path(), FakeInference::instant(), transfer.clone(), settings);

    relay.enqueue(session("S8", &[("1.1", "CT")])).await.unwrap();
    drain(&relay, 20).await;

    let sent = transfer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].peer_aet, "PACS");
    assert_eq!(sent[0].peer_host, "pacs.local");
    assert_eq!(sent[0].peer_port, 11112);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_processes_each_item_exactly_once() {
    let dir = TempDir::new().unwrap();
    let inference = FakeInference::new(Vec::new(), PollStep::Complete);
    let transfer = RecordingTransfer::new(0);
    let relay: Arc<ResultRelay> = relay_with(dir.path(), inference.clone(), transfer.clone(), settings(dir.path()));

    let sessions = 12;
    for n in 0..sessions {
        relay
            .enqueue(session(&format!("session-{}", n), &[("1.1", "CT"), ("1.2", "CT")]))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let workers = relay.spawn_workers(4, shutdown.clone());

    for _ in 0..500 {
        if relay.queue().archived_len().unwrap() == sessions as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(relay.queue().archived_len().unwrap(), sessions as u64);
    assert!(relay.queue().is_empty().unwrap());

    // Each item was claimed, submitted and relayed by exactly one worker
    let submitted = inference.submitted.lock().unwrap().clone();
    let distinct: HashSet<_> = submitted.iter().collect();
    assert_eq!(submitted.len(), sessions);
    assert_eq!(distinct.len(), sessions);
    assert_eq!(transfer.sent().len(), sessions);

    drop(relay);
    close_queue(dir.path());
}
