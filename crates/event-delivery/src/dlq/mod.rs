//! Dead Letter Queue: routing of failed messages, administration, and depth
//! monitoring.

pub mod alerts;
pub mod archive;
pub mod manager;
pub mod monitor;
pub mod router;

pub use alerts::{AlertSeverity, AlertSink, CallbackAlertSink, DlqAlert, LogAlertSink, WebhookAlertSink};
pub use archive::{ArchiveSink, JsonLinesArchive, MemoryArchive};
pub use manager::{
    ArchiveReport, BulkReplayReport, DlqFilter, DlqManager, DlqPage, DlqStats, ReplayItem,
    ReplayOutcome, MAX_PAGE_SIZE,
};
pub use monitor::DlqMonitor;
pub use router::DlqRouter;
