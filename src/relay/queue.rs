//! Work item persistence and claiming

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::models::{work_item_columns, WorkItem, WorkItemState};
use crate::storage::DurableQueueStore;

pub const WORK_ITEMS_TABLE: &str = "work_items";
pub const ARCHIVE_TABLE: &str = "work_items_archive";

/// How long a claim holds before another worker may take the item over
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(600);

/// Active work items plus the archive of finished ones
#[derive(Debug, Clone)]
pub struct WorkItemQueue {
    active: DurableQueueStore,
    archive: DurableQueueStore,
    claim_lease: Duration,
}

impl WorkItemQueue {
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            active: DurableQueueStore::open(data_dir, WORK_ITEMS_TABLE, work_item_columns())?,
            archive: DurableQueueStore::open(data_dir, ARCHIVE_TABLE, work_item_columns())?,
            claim_lease: DEFAULT_CLAIM_LEASE,
        })
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    /// Lease end for a claim taken or renewed now
    pub fn lease_deadline(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| Utc::now().checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Insert a new item; `DuplicateKey` if the id is taken
    pub fn insert(&self, item: &WorkItem) -> Result<()> {
        self.active.insert(&item.to_row()?)
    }

    /// Persist the current state of an item
    pub fn save(&self, item: &WorkItem) -> Result<()> {
        self.active.upsert(&item.to_row()?)
    }

    pub fn get(&self, id: &str) -> Result<Option<WorkItem>> {
        self.active.get(id)?.map(|row| WorkItem::from_row(&row)).transpose()
    }

    pub fn get_archived(&self, id: &str) -> Result<Option<WorkItem>> {
        self.archive.get(id)?.map(|row| WorkItem::from_row(&row)).transpose()
    }

    /// All active items; unreadable rows are logged and skipped
    pub fn list(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for row in self.active.enumerate()? {
            match WorkItem::from_row(&row?) {
                Ok(item) => items.push(item),
                Err(e) => tracing::error!("Skipping unreadable work item row: {}", e),
            }
        }
        Ok(items)
    }

    pub fn len(&self) -> Result<u64> {
        self.active.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.active.is_empty()
    }

    pub fn archived_len(&self) -> Result<u64> {
        self.archive.len()
    }

    /// Claim the first item that is due and not held by anyone.
    ///
    /// The check and the claim marker are written in one transaction, so two
    /// workers can never hold the same item while the lease runs. A claim
    /// whose lease has expired is taken over.
    pub fn claim_next(&self, worker: &str) -> Result<Option<WorkItem>> {
        let now = Utc::now();
        let expires_at = self.lease_deadline();

        for row in self.active.enumerate()? {
            let candidate = match WorkItem::from_row(&row?) {
                Ok(item) => item,
                Err(_) => continue,
            };
            if !candidate.is_claimable(now) {
                continue;
            }

            let claimed = self.active.update_if(&candidate.id, |current| {
                let mut item = WorkItem::from_row(&current).ok()?;
                if !item.is_claimable(now) {
                    return None;
                }
                if let Some(previous) = &item.claimed_by {
                    tracing::warn!(work_item = %item.id, previous = %previous, "Claim lease expired, taking over");
                }
                item.claimed_by = Some(worker.to_string());
                item.claim_expires_at = Some(expires_at);
                item.to_row().ok()
            })?;

            if let Some(row) = claimed {
                let item = WorkItem::from_row(&row)?;
                tracing::debug!(work_item = %item.id, state = %item.state, worker = %worker, "claimed");
                return Ok(Some(item));
            }
        }

        Ok(None)
    }

    /// Persist the item and drop its claim
    pub fn release(&self, item: &mut WorkItem) -> Result<()> {
        item.claimed_by = None;
        item.claim_expires_at = None;
        self.save(item)
    }

    /// Move an `Archived` item out of the active table
    pub fn archive(&self, id: &str) -> Result<bool> {
        let item = self
            .get(id)?
            .ok_or_else(|| GatewayError::invalid_argument(format!("No work item '{}'", id)))?;
        if item.state != WorkItemState::Archived {
            return Err(GatewayError::InvalidTransition {
                id: id.to_string(),
                from: item.state.to_string(),
                to: WorkItemState::Archived.to_string(),
            });
        }
        self.active.move_to(id, &self.archive)
    }

    /// Clear every claim marker; used at startup when no worker is running
    pub fn release_all_claims(&self) -> Result<usize> {
        let mut released = 0;
        for item in self.list()? {
            if item.claimed_by.is_none() {
                continue;
            }
            let updated = self.active.update_if(&item.id, |current| {
                let mut item = WorkItem::from_row(&current).ok()?;
                item.claimed_by.take()?;
                item.claim_expires_at = None;
                item.to_row().ok()
            })?;
            if updated.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Empty both tables
    pub fn clear(&self) -> Result<()> {
        self.active.clear()?;
        self.archive.clear()?;
        Ok(())
    }
}
