//! Inbound session capture.
//!
//! Runs the storage SCP, writes every received instance under a folder per
//! session and hands each released session to a [`SessionSink`].

mod session;

pub use session::{CompletedSession, DataReceived, SessionSink};

use async_trait::async_trait;
use dicom_core::dictionary::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use dimse::types::lookup_transfer_syntax;
use dimse::{
    AcceptancePolicy, AssociationContext, AssociationHandler, DimseConfig, DimseError, DimseScp,
    DimseStatus, ScpHandle, StoreRequest,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::adapters::dimse::status_mapper;
use crate::error::{GatewayError, Result};
use crate::models::ReceivedFile;
use crate::relay::RetryPolicy;
use crate::storage::{FilesystemStorage, StorageBackend};
use session::Session;

/// Written into a released session's folder until the sink has taken it
pub const PENDING_MARKER: &str = "session.pending.json";

/// ENOSPC
const NO_SPACE_LEFT: i32 = 28;

/// Why a received instance could not be saved
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error("save failed: {0}")]
    Unrecognized(String),
}

impl SaveError {
    /// Recognized failures get a specific status; the rest are generic
    pub fn is_recognized(&self) -> bool {
        !matches!(self, SaveError::Unrecognized(_))
    }

    fn from_io(err: std::io::Error, path: &Path) -> Self {
        let msg = format!("{}: {}", path.display(), err);
        if err.raw_os_error() == Some(NO_SPACE_LEFT) {
            SaveError::OutOfResources(msg)
        } else {
            SaveError::Unrecognized(msg)
        }
    }
}

/// Receiver boundary: the SCP listener plus per-session bookkeeping
pub struct SessionCapture {
    dimse_config: DimseConfig,
    storage: FilesystemStorage,
    channel_keyword: String,
    sessions: Mutex<HashMap<String, Session>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DataReceived>>>,
    sink: Arc<dyn SessionSink>,
    handoff_retry: RetryPolicy,
    listener: tokio::sync::Mutex<Option<ScpHandle>>,
}

impl SessionCapture {
    /// `channel_keyword` names the attribute (e.g. `Modality`) whose value is
    /// the channel of each received instance.
    pub fn new(
        dimse_config: DimseConfig,
        storage_dir: &Path,
        channel_keyword: &str,
        sink: Arc<dyn SessionSink>,
    ) -> Result<Arc<Self>> {
        Self::with_handoff_retry(dimse_config, storage_dir, channel_keyword, sink, RetryPolicy::default())
    }

    /// Like [`SessionCapture::new`], with the backoff used when the sink
    /// reports a transient failure
    pub fn with_handoff_retry(
        dimse_config: DimseConfig,
        storage_dir: &Path,
        channel_keyword: &str,
        sink: Arc<dyn SessionSink>,
        handoff_retry: RetryPolicy,
    ) -> Result<Arc<Self>> {
        if StandardDataDictionary.by_name(channel_keyword).is_none() {
            return Err(GatewayError::invalid_argument(format!(
                "Unknown DICOM attribute keyword '{}'",
                channel_keyword
            )));
        }

        Ok(Arc::new(Self {
            dimse_config,
            storage: FilesystemStorage::new(storage_dir)?,
            channel_keyword: channel_keyword.to_string(),
            sessions: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            sink,
            handoff_retry,
            listener: tokio::sync::Mutex::new(None),
        }))
    }

    /// Start listening on `port` (0 for an ephemeral port).
    ///
    /// Returns `Ok(true)` once the socket is bound within `timeout`, `Ok(false)`
    /// if the bind failed or took too long. Already running counts as started.
    pub async fn start(self: &Arc<Self>, port: u16, policy: AcceptancePolicy, timeout: Duration) -> Result<bool> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(true);
        }

        let config = DimseConfig {
            port,
            ..self.dimse_config.clone()
        };
        let handler: Arc<dyn AssociationHandler> = self.clone();
        let scp = DimseScp::new(config, handler).with_acceptance_policy(policy);

        match tokio::time::timeout(timeout, scp.spawn()).await {
            Ok(Ok(handle)) => {
                tracing::info!("📥 Session capture listening on {}", handle.local_addr());
                *listener = Some(handle);
                Ok(true)
            }
            Ok(Err(e @ (DimseError::Config(_) | DimseError::InvalidAeTitle(_)))) => Err(e.into()),
            Ok(Err(e)) => {
                tracing::error!("Session capture failed to listen on port {}: {}", port, e);
                Ok(false)
            }
            Err(_) => {
                tracing::error!(
                    "Session capture did not confirm listening within {:?}",
                    timeout
                );
                Ok(false)
            }
        }
    }

    /// Stop accepting associations. In-flight sessions finish normally.
    pub async fn stop(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!("📴 Session capture stopped");
        }
    }

    /// Address of the running listener
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(ScpHandle::local_addr)
    }

    /// "Data received" events, one per saved file. Each subscriber has its
    /// own unbounded channel, so a slow reader never misses an event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DataReceived> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Folder for a session's files, created on first use
    pub fn save_folder_path(&self, session_id: &str) -> Result<PathBuf> {
        self.storage.session_dir(session_id)
    }

    pub fn has_any_data(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|sessions| sessions.get(session_id).is_some_and(|s| !s.files.is_empty()))
            .unwrap_or(false)
    }

    /// Number of sessions currently tracked
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Decode and write one received instance under the session folder
    pub async fn save(&self, session_id: &str, request: &StoreRequest) -> std::result::Result<PathBuf, SaveError> {
        lookup_transfer_syntax(&request.transfer_syntax)
            .map_err(|e| SaveError::UnsupportedEncoding(e.to_string()))?;

        let object = request.decode().map_err(|e| match e {
            DimseError::UnsupportedTransferSyntax(uid) => SaveError::UnsupportedEncoding(uid),
            other => SaveError::MalformedPayload(other.to_string()),
        })?;

        let sop_instance_uid = dimse::types::trim_uid(&request.sop_instance_uid).to_string();
        if sop_instance_uid.is_empty() {
            return Err(SaveError::MalformedPayload("C-STORE without SOP Instance UID".into()));
        }

        let path = self
            .storage
            .session_file(session_id, &format!("{}.dcm", sop_instance_uid))
            .map_err(|e| match e {
                GatewayError::Io(io) => SaveError::from_io(io, self.storage.base_path()),
                GatewayError::InvalidArgument(msg) => SaveError::MalformedPayload(msg),
                other => SaveError::Unrecognized(other.to_string()),
            })?;

        let mut bytes = Vec::with_capacity(request.payload.len() + 512);
        object
            .write_all(&mut bytes)
            .map_err(|e| SaveError::Unrecognized(format!("Failed to encode {}: {}", sop_instance_uid, e)))?;

        // Written aside and renamed so a crash never leaves a truncated .dcm
        let partial = path.with_extension("dcm.part");
        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|e| SaveError::from_io(e, &partial))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| SaveError::from_io(e, &path))?;

        let channel = object
            .element_by_name(&self.channel_keyword)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let file = ReceivedFile::new(session_id, path.clone(), sop_instance_uid, channel);
        {
            let mut sessions = self
                .sessions
                .lock()
                .map_err(|e| SaveError::Unrecognized(format!("Session table poisoned: {}", e)))?;
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Session::new("", None))
                .record(file.clone());
        }

        tracing::debug!(
            session_id = %session_id,
            channel = ?file.channel,
            "Saved {}",
            path.display()
        );
        self.publish(DataReceived {
            session_id: session_id.to_string(),
            file,
        });

        Ok(path)
    }

    /// Deliver to every live subscriber; closed receivers are dropped
    fn publish(&self, event: DataReceived) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Hand every session left with a pending marker to the sink again.
    ///
    /// Run at startup, before the listener accepts associations. Returns how
    /// many sessions the sink took.
    pub async fn redeliver_pending(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(self.storage.base_path()).await?;
        let mut delivered = 0;

        while let Some(entry) = entries.next_entry().await? {
            let marker = entry.path().join(PENDING_MARKER);
            if !marker.is_file() {
                continue;
            }

            let session = match tokio::fs::read(&marker)
                .await
                .map_err(GatewayError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CompletedSession>(&bytes)?))
            {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!("Unreadable pending session {}: {}", marker.display(), e);
                    continue;
                }
            };

            let session_id = session.session_id.clone();
            match self.hand_off(session).await {
                Ok(()) => {
                    self.clear_pending(&session_id).await;
                    tracing::info!(session_id = %session_id, "Pending session handed over");
                    delivered += 1;
                }
                Err(e) => tracing::error!(
                    session_id = %session_id,
                    "Pending session still could not be queued: {}",
                    e
                ),
            }
        }
        Ok(delivered)
    }

    /// Pass a session to the sink, retrying transient failures with backoff
    async fn hand_off(&self, session: CompletedSession) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.sink.session_completed(session.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() || self.handoff_retry.is_exhausted(attempt) {
                        return Err(e);
                    }
                    let delay = self.handoff_retry.backoff_for(attempt);
                    tracing::warn!(
                        session_id = %session.session_id,
                        attempt,
                        "Session hand-off failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn write_pending(&self, session: &CompletedSession) -> Result<()> {
        let marker = self.storage.session_file(&session.session_id, PENDING_MARKER)?;
        let partial = marker.with_extension("json.part");
        tokio::fs::write(&partial, serde_json::to_vec(session)?).await?;
        tokio::fs::rename(&partial, &marker).await?;
        Ok(())
    }

    async fn clear_pending(&self, session_id: &str) {
        let marker = self.storage.subpath_str(session_id).join(PENDING_MARKER);
        if let Err(e) = tokio::fs::remove_file(&marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session_id = %session_id, "Failed to remove pending marker: {}", e);
            }
        }
    }

    fn take_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().ok().and_then(|mut s| s.remove(session_id))
    }

    fn snapshot_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().ok().and_then(|s| s.get(session_id).cloned())
    }
}

#[async_trait]
impl AssociationHandler for SessionCapture {
    async fn association_opened(&self, ctx: &AssociationContext) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(
                ctx.session_id.clone(),
                Session::new(ctx.calling_aet.clone(), Some(ctx.peer_addr)),
            );
        }
    }

    async fn store(&self, ctx: &AssociationContext, request: StoreRequest) -> DimseStatus {
        match self.save(&ctx.session_id, &request).await {
            Ok(_) => DimseStatus::Success,
            Err(e) => {
                if e.is_recognized() {
                    tracing::warn!(session_id = %ctx.session_id, "Rejected {}: {}", request.sop_instance_uid, e);
                } else {
                    tracing::error!(session_id = %ctx.session_id, "Could not save {}: {}", request.sop_instance_uid, e);
                }
                status_mapper::save_error_to_dimse(&e)
            }
        }
    }

    async fn association_closed(&self, ctx: &AssociationContext, released: bool) {
        let session_id = ctx.session_id.as_str();

        if !self.has_any_data(session_id) {
            self.take_session(session_id);
            tracing::debug!(session_id = %session_id, "Session closed without data");
            return;
        }

        if !released {
            // Abandoned: the peer never confirmed the transfer
            self.take_session(session_id);
            if let Err(e) = self.storage.remove_str(session_id).await {
                tracing::warn!(session_id = %session_id, "Failed to discard aborted session files: {}", e);
            }
            tracing::warn!(session_id = %session_id, "Association aborted, captured files discarded");
            return;
        }

        let Some(session) = self.snapshot_session(session_id) else {
            return;
        };
        let completed = CompletedSession {
            session_id: session_id.to_string(),
            calling_aet: if session.calling_aet.is_empty() {
                ctx.calling_aet.clone()
            } else {
                session.calling_aet
            },
            peer_addr: session.peer_addr.unwrap_or(ctx.peer_addr),
            files: session.files,
            created_at: session.created_at,
        };
        let file_count = completed.files.len();

        // On disk before the hand-off, so a session the sink never took survives a restart
        if let Err(e) = self.write_pending(&completed).await {
            tracing::error!(session_id = %session_id, "Failed to record pending session: {}", e);
        }

        match self.hand_off(completed).await {
            Ok(()) => {
                self.clear_pending(session_id).await;
                tracing::info!(
                    session_id = %session_id,
                    files = file_count,
                    "Session handed over"
                );
            }
            Err(e) => tracing::error!(
                session_id = %session_id,
                "Session could not be queued, kept in {} for redelivery at next start: {}",
                self.storage.subpath_str(session_id).display(),
                e
            ),
        }
        self.take_session(session_id);
    }
}
