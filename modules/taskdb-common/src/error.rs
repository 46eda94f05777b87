use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by every TaskDB component.
///
/// Transient backend failures are surfaced as-is; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum TaskDbError {
    /// One backend rejected an insert. Non-fatal to the caller: the other backend
    /// may have acknowledged, and the gap shows up later as replication drift.
    #[error("write rejected by {backend}: {reason}")]
    Write { backend: String, reason: String },

    /// Backend unreachable. Never to be read as an empty result.
    #[error("{backend} unreachable: {reason}")]
    Connectivity { backend: String, reason: String },

    #[error("{operation} against {backend} timed out after {}ms", .after.as_millis())]
    Timeout {
        backend: String,
        operation: String,
        after: Duration,
    },

    /// A read was accepted by the backend but failed (bad SQL, constraint, decode).
    #[error("query against {backend} failed: {reason}")]
    Query { backend: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    /// Policy-classified pin drift that blocks promotion.
    #[error("blocking drift on {} pin(s): {}", .ids.len(), .ids.join(", "))]
    Drift { ids: Vec<String> },

    #[error("outbox full ({capacity} events)")]
    QueueFull { capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl TaskDbError {
    /// True for errors that mean "we could not ask", as opposed to "we got an answer".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Timeout { .. })
    }
}

pub type TaskDbResult<T> = std::result::Result<T, TaskDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_backend_and_budget() {
        let err = TaskDbError::Timeout {
            backend: "postgres".into(),
            operation: "count".into(),
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "count against postgres timed out after 1500ms");
        assert!(err.is_unavailable());
    }

    #[test]
    fn drift_lists_pin_ids() {
        let err = TaskDbError::Drift {
            ids: vec!["c1".into(), "c7".into()],
        };
        assert_eq!(err.to_string(), "blocking drift on 2 pin(s): c1, c7");
        assert!(!err.is_unavailable());
    }
}
