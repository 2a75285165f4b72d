//! Pure domain logic: retry schedule, subject mapping, error taxonomy, and
//! the records that travel to the Dead Letter Queue.

pub mod errors;
pub mod metadata;
pub mod record;
pub mod retry;
pub mod subject;

pub use errors::{DeliveryError, HandlerError};
pub use metadata::DeliveryMetadata;
pub use record::{DlqEntry, DlqRecord};
pub use retry::RetryPolicy;
pub use subject::DlqSubjects;
