use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One instance written to disk during a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFile {
    /// Session (association) the file arrived on
    pub session_id: String,

    /// Where the Part 10 file was written
    pub path: PathBuf,

    pub sop_instance_uid: String,

    /// Channel read from the configured tag; `None` when the tag is absent
    pub channel: Option<String>,

    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    pub fn new(
        session_id: impl Into<String>,
        path: impl Into<PathBuf>,
        sop_instance_uid: impl Into<String>,
        channel: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            path: path.into(),
            sop_instance_uid: sop_instance_uid.into(),
            channel,
            received_at: Utc::now(),
        }
    }
}
