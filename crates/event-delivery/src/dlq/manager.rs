//! # DLQ Manager
//!
//! Administrative operations over the DLQ stream: list, inspect, replay,
//! archive, and delete. Replays go back through the [`Publisher`] using the
//! original bytes, so the replayed payload is identical to what failed.
//!
//! Bulk operations never abort on a single failure; each item reports its
//! own result.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use delivery_telemetry::{metric_inc, DLQ_REPLAYS};
use serde::{Deserialize, Serialize};
use shared_bus::{BusConnection, BusConnector, BusError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DeliveryConfig, DlqConfig};
use crate::connection::ConnectionSlot;
use crate::dlq::archive::ArchiveSink;
use crate::domain::{DeliveryError, DlqEntry};
use crate::publisher::{PublishOptions, Publisher};

/// Largest page `list` returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Filters for [`DlqManager::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqFilter {
    /// Substring of the original subject.
    pub subject: Option<String>,
    /// Exact error type, e.g. `SchemaError`.
    pub error_type: Option<String>,
    /// Exact consumer service.
    pub consumer_service: Option<String>,
}

impl DlqFilter {
    #[must_use]
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        let record = &entry.record;
        self.subject
            .as_deref()
            .map_or(true, |s| record.original_subject.contains(s))
            && self
                .error_type
                .as_deref()
                .map_or(true, |t| record.error_type == t)
            && self
                .consumer_service
                .as_deref()
                .map_or(true, |c| record.delivery.consumer_service == c)
    }
}

/// One page of DLQ entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    /// Entries matching the filter across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

/// Aggregate DLQ statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Age of the oldest entry; `None` when the DLQ is empty.
    pub oldest_age_seconds: Option<u64>,
    pub per_subject: BTreeMap<String, u64>,
    pub per_error_type: BTreeMap<String, u64>,
    /// Entries that could not be decoded as DLQ records.
    pub unreadable: u64,
}

/// Result of a successful replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub sequence: u64,
    pub subject: String,
    pub event_id: Option<Uuid>,
    /// The DLQ entry was removed.
    pub deleted: bool,
    /// New sequence of the rewritten record when it was kept.
    pub rewritten_as: Option<u64>,
}

/// Per-item result of a bulk replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayItem {
    pub sequence: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Result of a bulk replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReplayReport {
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<ReplayItem>,
}

/// Result of an archive run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub archived: usize,
    pub deleted: usize,
    pub location: String,
}

/// Administrative access to the DLQ.
pub struct DlqManager {
    connection: ConnectionSlot,
    config: DlqConfig,
    publisher: Arc<Publisher>,
    archive: Arc<dyn ArchiveSink>,
}

impl DlqManager {
    pub fn new(
        config: &DeliveryConfig,
        connector: Arc<dyn BusConnector>,
        publisher: Arc<Publisher>,
        archive: Arc<dyn ArchiveSink>,
    ) -> Self {
        Self {
            connection: ConnectionSlot::new(connector, config.bus.clone(), "dlq-manager"),
            config: config.dlq.clone(),
            publisher,
            archive,
        }
    }

    pub async fn connect(&self) -> Result<(), DeliveryError> {
        self.connection.connect().await.map(|_| ())
    }

    pub async fn close(&self) -> Result<(), DeliveryError> {
        self.connection.close().await
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    /// List entries, oldest first. `page` is 1-based.
    pub async fn list(
        &self,
        page: usize,
        page_size: usize,
        filter: &DlqFilter,
    ) -> Result<DlqPage, DeliveryError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);

        let matching: Vec<DlqEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();
        let total = matching.len();
        let skip = (page - 1).saturating_mul(page_size);
        let entries: Vec<DlqEntry> = matching.into_iter().skip(skip).take(page_size).collect();
        let has_more = skip + entries.len() < total;

        Ok(DlqPage {
            entries,
            total,
            page,
            page_size,
            has_more,
        })
    }

    /// Fetch one entry.
    pub async fn get(&self, sequence: u64) -> Result<DlqEntry, DeliveryError> {
        let connection = self.connection.get().await?;
        let message = connection
            .get_message(&self.config.stream_name, sequence)
            .await
            .map_err(|e| not_found(e, sequence))?;
        DlqEntry::from_stored(&message)
    }

    pub async fn stats(&self) -> Result<DlqStats, DeliveryError> {
        let connection = self.connection.get().await?;
        let info = connection.stream_info(&self.config.stream_name).await?;
        let mut stats = DlqStats {
            total_messages: info.messages,
            total_bytes: info.bytes,
            oldest_age_seconds: info
                .first_timestamp
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64),
            ..DlqStats::default()
        };

        for message in connection.stream_messages(&self.config.stream_name).await? {
            match DlqEntry::from_stored(&message) {
                Ok(entry) => {
                    *stats
                        .per_subject
                        .entry(entry.record.original_subject)
                        .or_default() += 1;
                    *stats
                        .per_error_type
                        .entry(entry.record.error_type)
                        .or_default() += 1;
                }
                Err(_) => stats.unreadable += 1,
            }
        }
        Ok(stats)
    }

    /// Republish the original payload to its original subject.
    ///
    /// With `delete_after` the entry is removed once the publish succeeds.
    /// Otherwise the record is rewritten with its replay count bumped.
    pub async fn replay(
        &self,
        sequence: u64,
        delete_after: bool,
    ) -> Result<ReplayOutcome, DeliveryError> {
        let result = self.replay_entry(sequence, delete_after).await;
        match &result {
            Ok(outcome) => {
                metric_inc!(DLQ_REPLAYS, &["success"]);
                info!(
                    sequence,
                    subject = %outcome.subject,
                    event_id = ?outcome.event_id,
                    deleted = outcome.deleted,
                    "DLQ entry replayed"
                );
            }
            Err(err) => {
                metric_inc!(DLQ_REPLAYS, &["failure"]);
                warn!(sequence, error = %err, "DLQ replay failed");
            }
        }
        result
    }

    /// Replay several entries, continuing past failures.
    pub async fn replay_bulk(&self, sequences: &[u64], delete_after: bool) -> BulkReplayReport {
        let mut report = BulkReplayReport::default();
        for &sequence in sequences {
            match self.replay(sequence, delete_after).await {
                Ok(_) => {
                    report.succeeded += 1;
                    report.results.push(ReplayItem {
                        sequence,
                        success: true,
                        error: None,
                    });
                }
                Err(err) => {
                    report.failed += 1;
                    report.results.push(ReplayItem {
                        sequence,
                        success: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        info!(
            requested = sequences.len(),
            succeeded = report.succeeded,
            failed = report.failed,
            "Bulk replay finished"
        );
        report
    }

    /// Copy entries older than `older_than_days` to the archive sink, then
    /// optionally delete them from the stream.
    pub async fn archive(
        &self,
        older_than_days: u32,
        delete_after: bool,
    ) -> Result<ArchiveReport, DeliveryError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        let expired: Vec<DlqEntry> = self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.stored_at <= cutoff)
            .collect();

        let archived = self.archive.store(&expired).await?;
        let mut deleted = 0;
        if delete_after {
            let connection = self.connection.get().await?;
            for entry in &expired {
                match connection
                    .delete_message(&self.config.stream_name, entry.sequence)
                    .await
                {
                    Ok(()) => deleted += 1,
                    Err(err) => {
                        warn!(sequence = entry.sequence, error = %err, "Archived entry not deleted");
                    }
                }
            }
        }

        info!(
            older_than_days,
            archived,
            deleted,
            location = %self.archive.location(),
            "DLQ archive finished"
        );
        Ok(ArchiveReport {
            archived,
            deleted,
            location: self.archive.location(),
        })
    }

    pub async fn delete(&self, sequence: u64) -> Result<(), DeliveryError> {
        let connection = self.connection.get().await?;
        connection
            .delete_message(&self.config.stream_name, sequence)
            .await
            .map_err(|e| not_found(e, sequence))?;
        info!(sequence, "DLQ entry deleted");
        Ok(())
    }

    /// Delete every entry. Returns how many were removed.
    pub async fn purge(&self) -> Result<u64, DeliveryError> {
        let connection = self.connection.get().await?;
        let mut removed = 0;
        for message in connection.stream_messages(&self.config.stream_name).await? {
            match connection
                .delete_message(&self.config.stream_name, message.sequence)
                .await
            {
                Ok(()) => removed += 1,
                // Expired between listing and deleting.
                Err(BusError::MessageNotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        warn!(removed, stream = %self.config.stream_name, "DLQ purged");
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<DlqEntry>, DeliveryError> {
        let connection = self.connection.get().await?;
        let messages = connection.stream_messages(&self.config.stream_name).await?;
        Ok(messages
            .iter()
            .filter_map(|message| match DlqEntry::from_stored(message) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(sequence = message.sequence, error = %err, "Skipping unreadable DLQ entry");
                    None
                }
            })
            .collect())
    }

    async fn replay_entry(
        &self,
        sequence: u64,
        delete_after: bool,
    ) -> Result<ReplayOutcome, DeliveryError> {
        let entry = self.get(sequence).await?;
        let record = &entry.record;
        let options = PublishOptions {
            durable: record.original_durable,
            ..PublishOptions::default()
        };
        let receipt = self
            .publisher
            .publish_raw(&record.original_subject, record.payload_bytes(), options)
            .await?;

        let connection = self.connection.get().await?;
        let mut outcome = ReplayOutcome {
            sequence,
            subject: receipt.subject,
            event_id: receipt.event_id.or(record.event_id),
            deleted: false,
            rewritten_as: None,
        };

        if delete_after {
            // The republish stands; a failed delete only leaves the entry behind.
            match connection
                .delete_message(&self.config.stream_name, sequence)
                .await
            {
                Ok(()) => outcome.deleted = true,
                Err(err) => warn!(
                    sequence,
                    error = %err,
                    "Replayed DLQ entry could not be deleted"
                ),
            }
        } else {
            outcome.rewritten_as = Some(self.rewrite(connection.as_ref(), entry).await?);
        }
        Ok(outcome)
    }

    /// Store the record with its replay fields updated, replacing the old one.
    async fn rewrite(
        &self,
        connection: &dyn BusConnection,
        entry: DlqEntry,
    ) -> Result<u64, DeliveryError> {
        let mut record = entry.record;
        record.mark_replayed();
        let payload = record.to_bytes().map_err(|e| DeliveryError::InvalidRecord {
            sequence: entry.sequence,
            reason: e.to_string(),
        })?;
        let ack = connection.publish_durable(&entry.subject, payload).await?;
        if let Err(err) = connection
            .delete_message(&self.config.stream_name, entry.sequence)
            .await
        {
            warn!(
                sequence = entry.sequence,
                rewritten_as = ack.sequence,
                error = %err,
                "Superseded DLQ record could not be deleted, both copies remain"
            );
        }
        Ok(ack.sequence)
    }
}

fn not_found(err: BusError, sequence: u64) -> DeliveryError {
    match err {
        BusError::MessageNotFound { .. } => DeliveryError::RecordNotFound(sequence),
        other => other.into(),
    }
}
