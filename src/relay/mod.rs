//! Result relay: drives work items from capture to the reply C-STORE

pub mod queue;
pub mod retry;

pub use queue::{WorkItemQueue, ARCHIVE_TABLE, DEFAULT_CLAIM_LEASE, WORK_ITEMS_TABLE};
pub use retry::RetryPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dimse::RemoteNode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CompletedSession, SessionSink};
use crate::error::{ErrorClass, GatewayError, Result};
use crate::grouping::{ensure_required_channels, group_by_channel};
use crate::inference::InferenceService;
use crate::models::{WorkItem, WorkItemState};
use crate::transfer::Transfer;
use crate::uid;

/// Length of the hashed work item id
pub const WORK_ITEM_ID_LENGTH: usize = 32;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// AE title used when sending results back
    pub own_aet: String,
    /// Port on the sender's host that receives results
    pub reply_port: u16,
    /// Fixed reply target; overrides the sender's address
    pub destination: Option<RemoteNode>,
    pub poll_interval: Duration,
    pub result_timeout: Duration,
    pub required_channels: Vec<String>,
    /// Results land in `<results_dir>/<work item id>/`
    pub results_dir: PathBuf,
    pub retry: RetryPolicy,
}

/// What startup recovery found in the queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub released_claims: usize,
    pub resumable: usize,
    pub failed: usize,
    pub archived: usize,
}

/// Result of one step of the state machine
#[derive(Debug, PartialEq)]
enum Step {
    /// Moved to a new state
    Advanced,
    /// Nothing to do until the given instant
    Wait(DateTime<Utc>),
}

pub struct ResultRelay {
    queue: WorkItemQueue,
    inference: Arc<dyn InferenceService>,
    transfer: Arc<dyn Transfer>,
    settings: RelaySettings,
    notify: Notify,
}

impl ResultRelay {
    pub fn new(
        queue: WorkItemQueue,
        inference: Arc<dyn InferenceService>,
        transfer: Arc<dyn Transfer>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            queue,
            inference,
            transfer,
            settings,
            notify: Notify::new(),
        }
    }

    pub fn queue(&self) -> &WorkItemQueue {
        &self.queue
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Turn a completed session into a queued work item.
    ///
    /// Idempotent per session: a session that already has an item (active or
    /// archived) gets that item back unchanged. Sessions whose files cannot
    /// be grouped are recorded as `Failed`.
    pub async fn enqueue(&self, session: CompletedSession) -> Result<WorkItem> {
        let id = uid::hash(&session.session_id, WORK_ITEM_ID_LENGTH)?;

        if let Some(existing) = self.queue.get(&id)? {
            tracing::debug!(work_item = %id, session = %session.session_id, "Session already queued");
            return Ok(existing);
        }
        if let Some(archived) = self.queue.get_archived(&id)? {
            return Ok(archived);
        }

        let reply_to = self.reply_destination(&session);
        let grouped = group_by_channel(&session.files).and_then(|groups| {
            ensure_required_channels(&groups, &self.settings.required_channels)?;
            Ok(groups)
        });

        let item = match grouped {
            Ok(channels) => {
                let mut item = WorkItem::new(id, session.session_id.as_str(), channels, reply_to);
                item.transition(WorkItemState::Queued)?;
                item
            }
            Err(e) if e.class() == ErrorClass::Domain => {
                tracing::warn!(session = %session.session_id, "Session cannot be processed: {}", e);
                let mut item = WorkItem::new(id, session.session_id.as_str(), Vec::new(), reply_to);
                item.fail(e.to_string())?;
                item
            }
            Err(e) => return Err(e),
        };

        match self.queue.insert(&item) {
            Ok(()) => {}
            Err(GatewayError::DuplicateKey(_)) => {
                return self
                    .queue
                    .get(&item.id)?
                    .ok_or_else(|| GatewayError::store_unavailable(format!("Work item {} vanished", item.id)));
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            work_item = %item.id,
            session = %item.session_id,
            state = %item.state,
            channels = item.channels.len(),
            "📥 Work item created"
        );
        if item.state == WorkItemState::Queued {
            self.notify.notify_one();
        }
        Ok(item)
    }

    fn reply_destination(&self, session: &CompletedSession) -> RemoteNode {
        match &self.settings.destination {
            Some(node) => node.clone(),
            None => RemoteNode::new(
                session.calling_aet.trim(),
                session.peer_addr.ip().to_string(),
                self.settings.reply_port,
            ),
        }
    }

    /// Bring the queue into a consistent state after a restart.
    ///
    /// Must run before any worker starts.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            released_claims: self.queue.release_all_claims()?,
            ..RecoveryReport::default()
        };

        for mut item in self.queue.list()? {
            match item.state {
                WorkItemState::Archived => {
                    self.queue.archive(&item.id)?;
                    report.archived += 1;
                }
                WorkItemState::Failed => report.failed += 1,
                WorkItemState::Capturing => {
                    item.fail("capture did not complete before shutdown")?;
                    self.queue.save(&item)?;
                    report.failed += 1;
                }
                _ => report.resumable += 1,
            }
        }

        tracing::info!(
            resumable = report.resumable,
            failed = report.failed,
            archived = report.archived,
            released_claims = report.released_claims,
            "Relay queue recovered"
        );
        Ok(report)
    }

    /// Spawn `count` workers that run until `shutdown` fires
    pub fn spawn_workers(self: &Arc<Self>, count: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|n| {
                let relay = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { relay.worker_loop(format!("worker-{}", n), shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: String, shutdown: CancellationToken) {
        tracing::info!(worker = %worker, "Relay worker started");
        let idle = self.settings.poll_interval.min(self.settings.retry.base_backoff);

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.process_next(&worker).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!(worker = %worker, "Failed to claim work: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
        }

        tracing::info!(worker = %worker, "Relay worker stopped");
    }

    /// Claim one due item and drive it as far as it can go right now.
    ///
    /// Returns `false` when nothing was claimable.
    pub async fn process_next(&self, worker: &str) -> Result<bool> {
        let Some(mut item) = self.queue.claim_next(worker)? else {
            return Ok(false);
        };

        self.drive(&mut item).await;

        if !self.release(&mut item).await {
            return Ok(true);
        }

        if item.state == WorkItemState::Archived {
            if let Err(e) = self.queue.archive(&item.id) {
                tracing::error!(work_item = %item.id, "Failed to archive work item: {}", e);
            }
        }
        Ok(true)
    }

    /// Drop the claim, retrying transient store failures with backoff.
    ///
    /// If every attempt fails the claim stays on disk until its lease expires.
    async fn release(&self, item: &mut WorkItem) -> bool {
        let policy = &self.settings.retry;
        let held_until = item.claim_expires_at;
        let mut attempt = 0;
        loop {
            match self.queue.release(item) {
                Ok(()) => return true,
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() || policy.is_exhausted(attempt) {
                        tracing::error!(
                            work_item = %item.id,
                            attempts = attempt,
                            "Failed to release work item, claim held until {:?}: {}",
                            held_until,
                            e
                        );
                        return false;
                    }
                    let delay = policy.backoff_for(attempt);
                    tracing::warn!(work_item = %item.id, attempt, "Release failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn drive(&self, item: &mut WorkItem) {
        while !item.state.is_terminal() {
            match self.step(item).await {
                Ok(Step::Advanced) => {
                    item.retry_count = 0;
                    item.not_before = None;
                    item.claim_expires_at = Some(self.queue.lease_deadline());
                    if let Err(e) = self.queue.save(item) {
                        self.record_failure(item, e);
                        return;
                    }
                }
                Ok(Step::Wait(until)) => {
                    item.retry_count = 0;
                    item.not_before = Some(until);
                    return;
                }
                Err(e) => {
                    self.record_failure(item, e);
                    return;
                }
            }
        }
    }

    async fn step(&self, item: &mut WorkItem) -> Result<Step> {
        match item.state {
            WorkItemState::Queued => {
                item.transition(WorkItemState::Forwarding)?;
                Ok(Step::Advanced)
            }
            WorkItemState::Forwarding => {
                let run_id = self.inference.submit(&item.id, &item.channels).await?;
                item.run_id = Some(run_id);
                item.submitted_at = Some(Utc::now());
                item.progress = 0;
                item.result_path = None;
                item.transition(WorkItemState::AwaitingResult)?;
                Ok(Step::Advanced)
            }
            WorkItemState::AwaitingResult => self.await_result(item).await,
            WorkItemState::Relaying => {
                self.relay_result(item).await?;
                item.transition(WorkItemState::Archived)?;
                Ok(Step::Advanced)
            }
            // Capturing items are never claimable and terminal ones never stepped
            state => Err(GatewayError::invalid_argument(format!(
                "Work item {} cannot be driven from state {}",
                item.id, state
            ))),
        }
    }

    async fn await_result(&self, item: &mut WorkItem) -> Result<Step> {
        let run_id = item
            .run_id
            .clone()
            .ok_or_else(|| GatewayError::invalid_argument(format!("Work item {} has no run id", item.id)))?;

        if let Some(submitted_at) = item.submitted_at {
            let elapsed = Utc::now().signed_duration_since(submitted_at).to_std();
            if elapsed.map_or(false, |elapsed| elapsed >= self.settings.result_timeout) {
                return Err(GatewayError::InferenceTimeout(self.settings.result_timeout.as_secs()));
            }
        }

        let output_dir = self.settings.results_dir.join(&item.id);
        let result = self.inference.poll(&run_id, &output_dir).await?;
        item.progress = item.progress.max(result.progress());

        if result.is_error() {
            return Err(GatewayError::InferenceFailed(result.error().to_string()));
        }

        match result.result() {
            Some(path) if result.is_complete() => {
                item.result_path = Some(path.to_path_buf());
                item.transition(WorkItemState::Relaying)?;
                tracing::info!(work_item = %item.id, run_id = %run_id, "Inference result ready");
                Ok(Step::Advanced)
            }
            _ => {
                tracing::debug!(work_item = %item.id, progress = item.progress, "Inference in progress");
                Ok(Step::Wait(after(self.settings.poll_interval)))
            }
        }
    }

    async fn relay_result(&self, item: &WorkItem) -> Result<()> {
        let result_path = item
            .result_path
            .clone()
            .ok_or_else(|| GatewayError::invalid_argument(format!("Work item {} has no result", item.id)))?;

        let node = &item.reply_to;
        let outcomes = self
            .transfer
            .send_batch(&self.settings.own_aet, &node.ae_title, node.port, &node.host, &[result_path])
            .await?;

        let failures: Vec<String> = outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.success)
            .map(|(path, outcome)| format!("{}: {}", path.display(), outcome.reason))
            .collect();
        if !failures.is_empty() {
            return Err(GatewayError::Transfer(failures.join("; ")));
        }

        tracing::info!(work_item = %item.id, "📤 Result relayed to {}", node);
        Ok(())
    }

    /// Apply the retry policy to a failed step
    fn record_failure(&self, item: &mut WorkItem, err: GatewayError) {
        let reason = err.to_string();

        let outcome = if err.is_transient() {
            item.retry_count += 1;
            if self.settings.retry.is_exhausted(item.retry_count) {
                let exhausted = GatewayError::RetriesExhausted {
                    attempts: item.retry_count,
                    last_error: reason,
                };
                tracing::error!(work_item = %item.id, state = %item.state, "❌ {}", exhausted);
                item.fail(exhausted.to_string())
            } else {
                let delay = self.settings.retry.backoff_for(item.retry_count);
                tracing::warn!(
                    work_item = %item.id,
                    state = %item.state,
                    attempt = item.retry_count,
                    "Transient failure, retrying in {:?}: {}",
                    delay,
                    reason
                );
                item.last_error = Some(reason);
                item.not_before = Some(after(delay));
                Ok(())
            }
        } else {
            tracing::error!(work_item = %item.id, state = %item.state, "❌ Work item failed: {}", reason);
            item.fail(reason)
        };

        if let Err(e) = outcome {
            tracing::error!(work_item = %item.id, "Could not record failure: {}", e);
        }
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl SessionSink for ResultRelay {
    async fn session_completed(&self, session: CompletedSession) -> Result<()> {
        self.enqueue(session).await.map(|_| ())
    }
}
