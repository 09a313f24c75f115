//! The durable unit of work and its lifecycle

use chrono::{DateTime, Utc};
use dimse::RemoteNode;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{GatewayError, Result};
use crate::models::ChannelData;
use crate::storage::{Column, ColumnType, QueueRow};

/// Queue table layout for work items; the first column is the key
pub const WORK_ITEM_COLUMNS: &[(&str, ColumnType)] = &[
    ("id", ColumnType::Text),
    ("session_id", ColumnType::Text),
    ("channels", ColumnType::Text),
    ("state", ColumnType::Text),
    ("retry_count", ColumnType::Integer),
    ("last_error", ColumnType::Text),
    ("created_at", ColumnType::Text),
    ("updated_at", ColumnType::Text),
    ("reply_to", ColumnType::Text),
    ("run_id", ColumnType::Text),
    ("submitted_at", ColumnType::Text),
    ("result_path", ColumnType::Text),
    ("progress", ColumnType::Integer),
    ("claimed_by", ColumnType::Text),
    ("claim_expires_at", ColumnType::Text),
    ("not_before", ColumnType::Text),
];

pub fn work_item_columns() -> Vec<Column> {
    WORK_ITEM_COLUMNS
        .iter()
        .map(|(name, column_type)| Column::new(*name, *column_type))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItemState {
    Capturing,
    Queued,
    Forwarding,
    AwaitingResult,
    Relaying,
    Archived,
    Failed,
}

impl WorkItemState {
    pub const ALL: [WorkItemState; 7] = [
        WorkItemState::Capturing,
        WorkItemState::Queued,
        WorkItemState::Forwarding,
        WorkItemState::AwaitingResult,
        WorkItemState::Relaying,
        WorkItemState::Archived,
        WorkItemState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemState::Archived | WorkItemState::Failed)
    }

    /// Allowed edges: the forward chain, plus `Failed` from any non-terminal state
    pub fn can_transition_to(&self, next: WorkItemState) -> bool {
        use WorkItemState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Capturing, Queued)
            | (Queued, Forwarding)
            | (Forwarding, AwaitingResult)
            | (AwaitingResult, Relaying)
            | (Relaying, Archived) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Capturing => "capturing",
            WorkItemState::Queued => "queued",
            WorkItemState::Forwarding => "forwarding",
            WorkItemState::AwaitingResult => "awaiting_result",
            WorkItemState::Relaying => "relaying",
            WorkItemState::Archived => "archived",
            WorkItemState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemState {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        WorkItemState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| GatewayError::invalid_argument(format!("Unknown work item state '{}'", s)))
    }
}

/// One session's journey from capture to reply
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub session_id: String,
    pub channels: Vec<ChannelData>,
    pub state: WorkItemState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Where the result is sent back to
    pub reply_to: RemoteNode,

    /// Inference run handle, set once submitted
    pub run_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub result_path: Option<PathBuf>,

    /// Highest progress seen so far
    pub progress: u8,

    /// Worker currently holding the item
    pub claimed_by: Option<String>,

    /// End of the claim lease; an expired claim no longer blocks other workers
    pub claim_expires_at: Option<DateTime<Utc>>,

    /// Not eligible for claiming before this instant
    pub not_before: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// New item in `Capturing`
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        channels: Vec<ChannelData>,
        reply_to: RemoteNode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            channels,
            state: WorkItemState::Capturing,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            reply_to,
            run_id: None,
            submitted_at: None,
            result_path: None,
            progress: 0,
            claimed_by: None,
            claim_expires_at: None,
            not_before: None,
        }
    }

    /// Move to `next`, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, next: WorkItemState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(work_item = %self.id, from = %self.state, to = %next, "work item transition");
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `Failed` and record the reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(WorkItemState::Failed)?;
        self.last_error = Some(reason.into());
        self.not_before = None;
        Ok(())
    }

    /// Whether a worker may pick this item up at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal()
            && self.state != WorkItemState::Capturing
            && !self.is_held(now)
            && self.not_before.map_or(true, |at| at <= now)
    }

    /// Claimed by a worker whose lease has not run out
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.claim_expires_at.map_or(true, |at| at > now)
    }

    pub fn to_row(&self) -> Result<QueueRow> {
        Ok(QueueRow::new()
            .with("id", self.id.as_str())
            .with("session_id", self.session_id.as_str())
            .with("channels", serde_json::to_string(&self.channels)?)
            .with("state", self.state.as_str())
            .with("retry_count", self.retry_count)
            .with("last_error", opt_value(self.last_error.clone()))
            .with("created_at", self.created_at.to_rfc3339())
            .with("updated_at", self.updated_at.to_rfc3339())
            .with("reply_to", serde_json::to_string(&self.reply_to)?)
            .with("run_id", opt_value(self.run_id.clone()))
            .with("submitted_at", opt_value(self.submitted_at.map(|t| t.to_rfc3339())))
            .with(
                "result_path",
                opt_value(self.result_path.as_ref().map(|p| p.to_string_lossy().to_string())),
            )
            .with("progress", self.progress)
            .with("claimed_by", opt_value(self.claimed_by.clone()))
            .with("claim_expires_at", opt_value(self.claim_expires_at.map(|t| t.to_rfc3339())))
            .with("not_before", opt_value(self.not_before.map(|t| t.to_rfc3339()))))
    }

    pub fn from_row(row: &QueueRow) -> Result<Self> {
        let text = |name: &str| -> Result<&str> {
            row.get_str(name).ok_or_else(|| {
                GatewayError::invalid_argument(format!("Work item row missing '{}'", name))
            })
        };
        let int = |name: &str| -> Result<i64> {
            row.get_i64(name).ok_or_else(|| {
                GatewayError::invalid_argument(format!("Work item row missing '{}'", name))
            })
        };

        Ok(Self {
            id: text("id")?.to_string(),
            session_id: text("session_id")?.to_string(),
            channels: serde_json::from_str(text("channels")?)?,
            state: text("state")?.parse()?,
            retry_count: u32::try_from(int("retry_count")?)
                .map_err(|_| GatewayError::invalid_argument("retry_count out of range"))?,
            last_error: row.get_str("last_error").map(str::to_string),
            created_at: parse_time(text("created_at")?)?,
            updated_at: parse_time(text("updated_at")?)?,
            reply_to: serde_json::from_str(text("reply_to")?)?,
            run_id: row.get_str("run_id").map(str::to_string),
            submitted_at: row.get_str("submitted_at").map(parse_time).transpose()?,
            result_path: row.get_str("result_path").map(PathBuf::from),
            progress: u8::try_from(int("progress")?)
                .map_err(|_| GatewayError::invalid_argument("progress out of range"))?,
            claimed_by: row.get_str("claimed_by").map(str::to_string),
            claim_expires_at: row.get_str("claim_expires_at").map(parse_time).transpose()?,
            not_before: row.get_str("not_before").map(parse_time).transpose()?,
        })
    }
}

fn opt_value(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::invalid_argument(format!("Bad timestamp '{}': {}", s, e)))
}
