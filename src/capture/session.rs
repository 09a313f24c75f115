use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::Result;
use crate::models::ReceivedFile;

/// In-memory record of one association, owned by the capture until it closes
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub calling_aet: String,
    pub peer_addr: Option<SocketAddr>,
    pub files: Vec<ReceivedFile>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(calling_aet: impl Into<String>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            calling_aet: calling_aet.into(),
            peer_addr,
            files: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Record a saved file. A repeated instance replaces the earlier record in place.
    pub fn record(&mut self, file: ReceivedFile) {
        match self.files.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => *existing = file,
            None => self.files.push(file),
        }
    }
}

/// "Data received" event, one per saved file
#[derive(Debug, Clone)]
pub struct DataReceived {
    pub session_id: String,
    pub file: ReceivedFile,
}

/// Everything captured on one released association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedSession {
    pub session_id: String,
    pub calling_aet: String,
    pub peer_addr: SocketAddr,
    /// Files in receipt order
    pub files: Vec<ReceivedFile>,
    pub created_at: DateTime<Utc>,
}

/// Takes ownership of completed sessions.
///
/// The capture waits for `session_completed` to return before it forgets the
/// session, so an `Ok` must mean the session is durably recorded.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn session_completed(&self, session: CompletedSession) -> Result<()>;
}
