//! Copy every state record from one backend to another.
//!
//! Records are copied byte for byte, keeping identity, codec tag, version
//! and timestamp; nothing is re-encoded. A record already present on the
//! destination with the same payload, codec and version is left alone, so
//! running a migration twice changes nothing the second time.
//!
//! The source should be idle while migrating: concurrent writers on the
//! source may or may not have their latest write copied.

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::store::{FunctionId, StateBackend, StateRecord};

/// What happened to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Written to the destination at this version.
    Copied { version: u64 },
    /// The destination already held an identical record.
    Unchanged,
    /// Vanished from the source between listing and reading.
    Skipped,
    Failed(String),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ItemOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub identity: FunctionId,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Overall result of a migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Every identity was copied or already present.
    Complete,
    /// At least one identity failed; see the per-item report.
    Partial,
    SourceUnreadable(String),
    DestinationUnwritable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub items: Vec<ItemReport>,
}

impl MigrationReport {
    /// A report for a run that stopped before copying anything.
    pub fn aborted(status: MigrationStatus) -> Self {
        Self {
            status,
            items: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|i| !i.outcome.is_success())
    }

    pub fn is_complete(&self) -> bool {
        self.status == MigrationStatus::Complete
    }

    /// One-line summary, e.g. `2/2 succeeded`.
    pub fn summary(&self) -> String {
        match &self.status {
            MigrationStatus::SourceUnreadable(reason) => format!("source unreadable: {reason}"),
            MigrationStatus::DestinationUnwritable(reason) => {
                format!("destination unwritable: {reason}")
            }
            _ => format!("{}/{} succeeded", self.succeeded(), self.total()),
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

fn same_record(a: &StateRecord, b: &StateRecord) -> bool {
    a.version == b.version && a.codec == b.codec && a.payload == b.payload
}

async fn migrate_one(
    source: &dyn StateBackend,
    destination: &dyn StateBackend,
    id: &FunctionId,
) -> ItemOutcome {
    let record = match source.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => return ItemOutcome::Skipped,
        Err(e) => return ItemOutcome::Failed(format!("read: {e}")),
    };

    match destination.get(id).await {
        Ok(Some(existing)) if same_record(&existing, &record) => return ItemOutcome::Unchanged,
        Ok(_) => {}
        Err(e) => return ItemOutcome::Failed(format!("destination read: {e}")),
    }

    match destination.restore(&record).await {
        Ok(()) => ItemOutcome::Copied {
            version: record.version,
        },
        Err(e) => ItemOutcome::Failed(format!("write: {e}")),
    }
}

/// Copy all records from `source` to `destination`.
///
/// A failure on one identity is recorded and the rest are still copied.
pub async fn migrate(source: &dyn StateBackend, destination: &dyn StateBackend) -> MigrationReport {
    if let Err(e) = destination.healthcheck().await {
        warn!(error = %e, "destination failed healthcheck");
        return MigrationReport::aborted(MigrationStatus::DestinationUnwritable(e.to_string()));
    }

    let ids = match source.list().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "cannot list source records");
            return MigrationReport::aborted(MigrationStatus::SourceUnreadable(e.to_string()));
        }
    };

    info!(
        from = %source.kind(),
        to = %destination.kind(),
        count = ids.len(),
        "migrating state records"
    );

    let mut items = Vec::with_capacity(ids.len());
    for identity in ids {
        let outcome = migrate_one(source, destination, &identity).await;
        if let ItemOutcome::Failed(reason) = &outcome {
            warn!(%identity, %reason, "record not migrated");
        }
        items.push(ItemReport { identity, outcome });
    }

    let status = if items.iter().all(|i| i.outcome.is_success()) {
        MigrationStatus::Complete
    } else {
        MigrationStatus::Partial
    };
    let report = MigrationReport { status, items };
    info!(summary = %report, "migration finished");
    report
}
