//! Reversible mapping between event subjects and their DLQ subjects.
//!
//! The root namespace token is replaced by the configured DLQ prefix: with
//! namespace `ns` and prefix `ns.dlq`, `ns.field.created` maps to
//! `ns.dlq.field.created`; with prefix `events.dlq` it maps to
//! `events.dlq.field.created`. Subscriptions are confined to the namespace,
//! so every mapped subject shares the same root and the mapping is injective.

use crate::config::DeliveryConfig;

/// Subject mapping for one namespace and DLQ prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqSubjects {
    namespace: String,
    prefix: String,
}

impl DlqSubjects {
    #[must_use]
    pub fn new(namespace: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(&config.bus.namespace, &config.dlq.subject_prefix)
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `subject` is the DLQ prefix or lies beneath it.
    #[must_use]
    pub fn is_dlq_subject(&self, subject: &str) -> bool {
        subject == self.prefix
            || subject
                .strip_prefix(&self.prefix)
                .is_some_and(|rest| rest.starts_with('.'))
    }

    /// Whether `subject` (or pattern) is rooted in the namespace.
    #[must_use]
    pub fn in_namespace(&self, subject: &str) -> bool {
        subject.split('.').next() == Some(self.namespace.as_str())
    }

    /// DLQ subject for an original subject.
    #[must_use]
    pub fn dlq_subject(&self, original: &str) -> String {
        match original.split_once('.') {
            Some((_, rest)) => format!("{}.{rest}", self.prefix),
            None => self.prefix.clone(),
        }
    }

    /// Inverse of [`DlqSubjects::dlq_subject`]; `None` when `subject` is not
    /// under the DLQ prefix.
    #[must_use]
    pub fn original_subject(&self, subject: &str) -> Option<String> {
        if subject == self.prefix {
            return Some(self.namespace.clone());
        }
        let rest = subject.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        Some(format!("{}.{rest}", self.namespace))
    }
}

impl Default for DlqSubjects {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefix_inserts_segment() {
        let subjects = DlqSubjects::default();
        assert_eq!(subjects.dlq_subject("ns.field.created"), "ns.dlq.field.created");
        assert_eq!(subjects.dlq_subject("ns.weather.alert"), "ns.dlq.weather.alert");
        assert_eq!(subjects.dlq_subject("ns"), "ns.dlq");
    }

    #[test]
    fn test_custom_prefix_replaces_root() {
        let subjects = DlqSubjects::new("ns", "events.dlq");
        assert_eq!(subjects.dlq_subject("ns.field.deleted"), "events.dlq.field.deleted");
        assert_eq!(
            subjects.original_subject("events.dlq.field.deleted").as_deref(),
            Some("ns.field.deleted")
        );
        assert!(subjects.is_dlq_subject("events.dlq.field.deleted"));
        assert!(!subjects.is_dlq_subject("events.dlqx.field"));
    }

    #[test]
    fn test_mapping_is_reversible() {
        for subjects in [DlqSubjects::default(), DlqSubjects::new("app", "ops.dead")] {
            let root = subjects.namespace().to_string();
            for tail in ["", ".field.created", ".task.completed.v2", ".a", ".dlq"] {
                let subject = format!("{root}{tail}");
                let mapped = subjects.dlq_subject(&subject);
                assert!(subjects.is_dlq_subject(&mapped));
                assert_eq!(subjects.original_subject(&mapped), Some(subject));
            }
        }
    }

    #[test]
    fn test_non_dlq_subjects() {
        let subjects = DlqSubjects::default();
        assert_eq!(subjects.original_subject("ns.field.created"), None);
        assert_eq!(subjects.original_subject("ns"), None);
        assert_eq!(subjects.original_subject("ns.dlqfield"), None);
    }

    #[test]
    fn test_mapping_is_injective_within_namespace() {
        let subjects = DlqSubjects::default();
        assert_ne!(subjects.dlq_subject("ns.dlq"), subjects.dlq_subject("ns"));
        assert_ne!(subjects.dlq_subject("ns.b.c"), subjects.dlq_subject("ns.bc"));
        assert!(subjects.in_namespace("ns.>"));
        assert!(!subjects.in_namespace("nsx.field"));
        assert!(!subjects.in_namespace("*.field"));
    }
}
