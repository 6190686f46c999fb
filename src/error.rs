// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Classifies failures into retryable and fatal kinds for the orchestrator

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network, authentication, or lock contention failure. Retried with backoff.
    #[error("connectivity error on endpoint '{endpoint}': {message}")]
    Connectivity { endpoint: String, message: String },

    /// A database call exceeded the statement timeout. Retried with backoff.
    #[error("operation on endpoint '{endpoint}' timed out after {secs}s: {operation}")]
    Timeout {
        endpoint: String,
        operation: String,
        secs: u64,
    },

    /// Missing table, missing privilege, primary key mismatch, or type mismatch. Never retried.
    #[error("schema error on endpoint '{endpoint}': {message}")]
    Schema { endpoint: String, message: String },

    /// A key is parked behind an open manual conflict. Deferred state, not a failure.
    #[error("conflict {conflict_id} on pair '{pair_id}' key '{pk_text}' awaits resolution")]
    ConflictUnresolved {
        pair_id: String,
        pk_text: String,
        conflict_id: i64,
    },

    /// Constraint violation while applying a row.
    #[error("apply failed on endpoint '{endpoint}': {message}")]
    Apply { endpoint: String, message: String },

    /// The apply failed again after refreshing the rows from their source.
    #[error("apply on endpoint '{endpoint}' failed after refresh retry: {message}")]
    ApplyEscalated { endpoint: String, message: String },

    /// The target received new local writes for the keys being applied while the cycle ran.
    #[error("concurrent writes on endpoint '{endpoint}' for {keys} key(s) being applied")]
    ConcurrentChange { endpoint: String, keys: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("journal error: {0:#}")]
    Journal(#[from] anyhow::Error),

    #[error("unknown table pair '{0}'")]
    UnknownPair(String),

    #[error("unknown conflict {0}")]
    UnknownConflict(i64),
}

impl SyncError {
    pub fn connectivity(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Connectivity {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn schema(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Schema {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn apply(endpoint: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Apply {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl ToString) -> Self {
        SyncError::Config(message.to_string())
    }

    /// True for failures the orchestrator absorbs with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. }
                | SyncError::Timeout { .. }
                | SyncError::ConcurrentChange { .. }
        )
    }

    /// Endpoint the error originated from, when known.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            SyncError::Connectivity { endpoint, .. }
            | SyncError::Timeout { endpoint, .. }
            | SyncError::Schema { endpoint, .. }
            | SyncError::Apply { endpoint, .. }
            | SyncError::ApplyEscalated { endpoint, .. }
            | SyncError::ConcurrentChange { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::connectivity("pg", "connection refused").is_retryable());
        assert!(SyncError::Timeout {
            endpoint: "pg".into(),
            operation: "read".into(),
            secs: 30
        }
        .is_retryable());
        assert!(!SyncError::schema("pg", "permission denied").is_retryable());
        assert!(!SyncError::apply("pg", "duplicate key").is_retryable());
        assert!(!SyncError::config("bad").is_retryable());
        assert!(!SyncError::UnknownPair("crm".into()).is_retryable());
    }

    #[test]
    fn test_endpoint_is_reported() {
        let err = SyncError::apply("mysql-local", "duplicate entry");
        assert_eq!(err.endpoint(), Some("mysql-local"));
        assert_eq!(SyncError::UnknownConflict(3).endpoint(), None);
        assert!(err.to_string().contains("mysql-local"));
    }

    #[test]
    fn test_unresolved_conflict_is_deferred_not_retried() {
        let waiting = SyncError::ConflictUnresolved {
            pair_id: "customers".into(),
            pk_text: "42".into(),
            conflict_id: 7,
        };
        assert!(!waiting.is_retryable());
        assert_eq!(waiting.endpoint(), None);
        assert_eq!(
            waiting.to_string(),
            "conflict 7 on pair 'customers' key '42' awaits resolution"
        );
    }
}
