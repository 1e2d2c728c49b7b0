use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: actor '{actor}' may not access hub '{hub}'")]
    Permission { actor: String, hub: String },

    #[error("hub not found: {0}")]
    NotFound(String),

    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    #[error("infrastructure failure: {0}")]
    Infra(String),

    #[error("{operation} timed out after {}s; cleanup: {cleanup}", .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
        cleanup: String,
    },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("config file not found: {}: run 'jupytercluster config init'", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::TransientInfra(_))
    }

    /// Short machine-readable kind, used by the CLI's JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::Validation(_) => "validation",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::Permission { .. } => "permission",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::TransientInfra(_) => "transient_infra",
            ClusterError::Infra(_) => "infra",
            ClusterError::Timeout { .. } => "timeout",
            ClusterError::Cancelled(_) => "cancelled",
            ClusterError::Store(_) => "store",
            ClusterError::ConfigNotFound(_) | ClusterError::Config(_) => "config",
            ClusterError::Io(_) | ClusterError::Yaml(_) | ClusterError::Json(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_infra_is_retryable() {
        assert!(ClusterError::TransientInfra("connection refused".into()).is_transient());
        assert!(!ClusterError::Infra("chart not found".into()).is_transient());
        assert!(!ClusterError::Timeout {
            operation: "install".into(),
            after: Duration::from_secs(5),
            cleanup: "release removed".into(),
        }
        .is_transient());
    }

    #[test]
    fn timeout_message_names_cleanup() {
        let err = ClusterError::Timeout {
            operation: "install jupyterhub-a".into(),
            after: Duration::from_secs(300),
            cleanup: "release uninstalled".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("300s"), "{msg}");
        assert!(msg.contains("release uninstalled"), "{msg}");
    }

    #[test]
    fn permission_is_distinct_from_not_found() {
        let denied = ClusterError::Permission {
            actor: "testuser".into(),
            hub: "admin-hub".into(),
        };
        assert_eq!(denied.kind(), "permission");
        assert_eq!(ClusterError::NotFound("x".into()).kind(), "not_found");
    }
}
