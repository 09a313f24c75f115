mod support;

use chrono::Utc;
use dimse::RemoteNode;
use seggate::models::{ChannelData, WorkItem, WorkItemState};
use seggate::relay::WorkItemQueue;
use std::path::{Path, PathBuf};
use std::time::Duration;
use support::{close_queue, drain, relay_with, settings, FakeInference, RecordingTransfer};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn item_in(id: &str, path: &[WorkItemState]) -> WorkItem {
    let channels = vec![ChannelData::new("CT", vec![PathBuf::from("/data/s/1.dcm")], false).unwrap()];
    let mut item = WorkItem::new(id, format!("session-{}", id), channels, RemoteNode::new("MODALITY", "10.0.0.7", 104));
    for state in path {
        item.transition(*state).unwrap();
    }
    item
}

/// Write rows as a crashed process would have left them, then close the file
fn persist_before_crash(dir: &Path, items: &[WorkItem]) {
    {
        let queue = WorkItemQueue::open(dir).unwrap();
        for item in items {
            queue.insert(item).unwrap();
        }
    }
    close_queue(dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwarding_item_resumes_after_restart() {
    use WorkItemState::*;
    let dir = TempDir::new().unwrap();

    let mut stuck = item_in("fwd", &[Queued, Forwarding]);
    stuck.claimed_by = Some("worker-0".into());
    persist_before_crash(dir.path(), &[stuck]);

    let inference = FakeInference::instant();
    let transfer = RecordingTransfer::new(0);
    let relay = relay_with(dir.path(), inference.clone(), transfer.clone(), settings(dir.path()));

    let report = relay.recover().unwrap();
    assert_eq!(report.released_claims, 1);
    assert_eq!(report.resumable, 1);

    let shutdown = CancellationToken::new();
    let workers = relay.spawn_workers(2, shutdown.clone());
    for _ in 0..300 {
        if relay.queue().archived_len().unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    let done = relay.queue().get_archived("fwd").unwrap().unwrap();
    assert_eq!(done.state, Archived);
    // Forwarding is resubmitted after a crash
    assert_eq!(inference.submit_count(), 1);
    assert_eq!(transfer.sent().len(), 1);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn awaiting_item_is_polled_without_resubmitting() {
    use WorkItemState::*;
    let dir = TempDir::new().unwrap();

    let mut waiting = item_in("wait", &[Queued, Forwarding, AwaitingResult]);
    waiting.run_id = Some("run-before-crash".into());
    waiting.submitted_at = Some(Utc::now());
    waiting.progress = 70;
    persist_before_crash(dir.path(), &[waiting]);

    let inference = FakeInference::instant();
    let relay = relay_with(dir.path(), inference.clone(), RecordingTransfer::new(0), settings(dir.path()));
    relay.recover().unwrap();
    drain(&relay, 20).await;

    assert_eq!(relay.queue().get_archived("wait").unwrap().unwrap().state, Archived);
    assert_eq!(inference.submit_count(), 0);
    assert_eq!(inference.polled.lock().unwrap().as_slice(), ["run-before-crash"]);

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn recovery_settles_terminal_rows() {
    use WorkItemState::*;
    let dir = TempDir::new().unwrap();

    let archived = item_in("arch", &[Queued, Forwarding, AwaitingResult, Relaying, Archived]);
    let mut failed = item_in("fail", &[Queued]);
    failed.fail("bad input").unwrap();
    let queued = item_in("queued", &[Queued]);
    persist_before_crash(dir.path(), &[archived, failed, queued]);

    let relay = relay_with(dir.path(), FakeInference::instant(), RecordingTransfer::new(0), settings(dir.path()));
    let report = relay.recover().unwrap();
    assert_eq!(report.archived, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.resumable, 1);

    assert!(relay.queue().get("arch").unwrap().is_none());
    assert!(relay.queue().get_archived("arch").unwrap().is_some());

    // Recovery twice leaves the same picture
    let again = relay.recover().unwrap();
    assert_eq!(again.archived, 0);
    assert_eq!(again.failed, 1);
    assert_eq!(again.resumable, 1);

    let failed = relay.queue().get("fail").unwrap().unwrap();
    assert_eq!(failed.state, Failed);
    assert_eq!(failed.last_error.as_deref(), Some("bad input"));

    drop(relay);
    close_queue(dir.path());
}

#[tokio::test]
async fn reloaded_item_matches_what_was_stored() {
    use WorkItemState::*;
    let dir = TempDir::new().unwrap();

    let channels = vec![
        ChannelData::new("CT", vec![PathBuf::from("/d/1.dcm"), PathBuf::from("/d/2.dcm")], false).unwrap(),
        ChannelData::new("RTSTRUCT", vec![PathBuf::from("/d/3.dcm")], false).unwrap(),
    ];
    let mut item = WorkItem::new("rt", "session-rt", channels.clone(), RemoteNode::new("M", "h", 104));
    item.transition(Queued).unwrap();
    persist_before_crash(dir.path(), &[item.clone()]);

    let queue = WorkItemQueue::open(dir.path()).unwrap();
    let reloaded = queue.get("rt").unwrap().unwrap();
    assert_eq!(reloaded.state, Queued);
    assert_eq!(reloaded.channels, channels);
    for (a, b) in reloaded.channels.iter().zip(&channels) {
        assert_eq!(a.files(), b.files());
    }

    drop(queue);
    close_queue(dir.path());
}
