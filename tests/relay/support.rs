#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use seggate::capture::CompletedSession;
use seggate::error::{GatewayError, Result};
use seggate::inference::InferenceService;
use seggate::models::{ChannelData, ModelResult, ReceivedFile};
use seggate::relay::{RelaySettings, ResultRelay, RetryPolicy, WorkItemQueue};
use seggate::storage::queue_store::QUEUE_DB_FILE;
use seggate::storage::DatabaseManager;
use seggate::transfer::{OperationResult, Transfer};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// What the fake model server answers to the next poll
#[derive(Debug, Clone)]
pub enum PollStep {
    Progress(u8),
    Complete,
    Error(String),
    Unreachable,
}

pub struct FakeInference {
    script: Mutex<VecDeque<PollStep>>,
    fallback: PollStep,
    pub submitted: Mutex<Vec<String>>,
    pub polled: Mutex<Vec<String>>,
}

impl FakeInference {
    pub fn new(script: Vec<PollStep>, fallback: PollStep) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            submitted: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
        })
    }

    /// Completes on the first poll
    pub fn instant() -> Arc<Self> {
        Self::new(Vec::new(), PollStep::Complete)
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> usize {
        self.polled.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceService for FakeInference {
    async fn submit(&self, work_item_id: &str, channels: &[ChannelData]) -> Result<String> {
        assert!(!channels.is_empty());
        self.submitted.lock().unwrap().push(work_item_id.to_string());
        Ok(format!("run-{}", work_item_id))
    }

    async fn poll(&self, run_id: &str, output_dir: &Path) -> Result<ModelResult> {
        self.polled.lock().unwrap().push(run_id.to_string());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            PollStep::Progress(p) => Ok(ModelResult::in_progress(p)),
            PollStep::Complete => {
                std::fs::create_dir_all(output_dir)?;
                let path = output_dir.join(format!("{}.dcm", run_id));
                std::fs::write(&path, b"RTSTRUCT")?;
                ModelResult::new(100, "", Some(path))
            }
            PollStep::Error(reason) => Ok(ModelResult::failed(0, reason)),
            PollStep::Unreachable => Err(GatewayError::Network("connection refused".into())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub peer_aet: String,
    pub peer_host: String,
    pub peer_port: u16,
    pub files: Vec<PathBuf>,
}

/// Records sends; the first `failures` batches fail
pub struct RecordingTransfer {
    failures: Mutex<usize>,
    pub sent: Mutex<Vec<Sent>>,
}

impl RecordingTransfer {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for RecordingTransfer {
    async fn probe(&self, _: &str, _: &str, _: u16, _: &str) -> Result<OperationResult> {
        Ok(OperationResult::succeeded())
    }

    async fn send_batch(
        &self,
        _own_aet: &str,
        peer_aet: &str,
        peer_port: u16,
        peer_host: &str,
        files: &[PathBuf],
    ) -> Result<Vec<(PathBuf, OperationResult)>> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Ok(files
                    .iter()
                    .map(|f| (f.clone(), OperationResult::failed("association rejected")))
                    .collect());
            }
        }

        self.sent.lock().unwrap().push(Sent {
            peer_aet: peer_aet.to_string(),
            peer_host: peer_host.to_string(),
            peer_port,
            files: files.to_vec(),
        });
        Ok(files.iter().map(|f| (f.clone(), OperationResult::succeeded())).collect())
    }
}

pub fn settings(data_dir: &Path) -> RelaySettings {
    RelaySettings {
        own_aet: "SEGGATE".into(),
        reply_port: 104,
        destination: None,
        poll_interval: Duration::from_millis(10),
        result_timeout: Duration::from_secs(60),
        required_channels: Vec::new(),
        results_dir: data_dir.join("results"),
        retry: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
    }
}

pub fn relay_with(
    data_dir: &Path,
    inference: Arc<FakeInference>,
    transfer: Arc<RecordingTransfer>,
    settings: RelaySettings,
) -> Arc<ResultRelay> {
    let queue = WorkItemQueue::open(data_dir).unwrap();
    Arc::new(ResultRelay::new(queue, inference, transfer, settings))
}

/// A released session with `(sop uid, channel)` files
pub fn session(session_id: &str, files: &[(&str, &str)]) -> CompletedSession {
    CompletedSession {
        session_id: session_id.to_string(),
        calling_aet: "MODALITY".to_string(),
        peer_addr: "10.20.30.40:51000".parse().unwrap(),
        files: files
            .iter()
            .map(|(uid, channel)| {
                ReceivedFile::new(
                    session_id,
                    format!("/data/{}/{}.dcm", session_id, uid),
                    *uid,
                    Some(channel.to_string()),
                )
            })
            .collect(),
        created_at: Utc::now(),
    }
}

/// Drive single items with `process_next` until nothing is claimable and
/// nothing is waiting, or the attempts run out
pub async fn drain(relay: &ResultRelay, attempts: usize) {
    for _ in 0..attempts {
        let processed = relay.process_next("test-worker").await.unwrap();
        if !processed {
            if relay.queue().list().unwrap().iter().all(|i| i.state.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn close_queue(data_dir: &Path) {
    let _ = DatabaseManager::global().close_database(&data_dir.join(QUEUE_DB_FILE));
}
