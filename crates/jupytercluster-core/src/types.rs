//! Hub, Operation and Actor data model.
//!
//! A `Hub` is one tenant's notebook-hub deployment. Every change to its
//! deployed state is tracked by an `Operation`; at most one non-terminal
//! operation exists per hub at any instant.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClusterError, Result};
use crate::sanitize::AuditEntry;

pub type HubId = Uuid;

// ---------------------------------------------------------------------------
// HubState
// ---------------------------------------------------------------------------

/// Lifecycle state of a hub.
///
/// ```text
/// Created ──start──▶ Installing ──▶ Running ──stop──▶ Stopping ──▶ Stopped
///    │                   │                                            │
///    └──────delete───────┴───────▶ Uninstalling ──▶ Deleted ◀─────────┘
/// ```
/// Any failed operation moves the hub to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubState {
    Created,
    Installing,
    Running,
    Stopping,
    Stopped,
    Uninstalling,
    Deleted,
    Error,
}

impl HubState {
    pub fn as_str(self) -> &'static str {
        match self {
            HubState::Created => "created",
            HubState::Installing => "installing",
            HubState::Running => "running",
            HubState::Stopping => "stopping",
            HubState::Stopped => "stopped",
            HubState::Uninstalling => "uninstalling",
            HubState::Deleted => "deleted",
            HubState::Error => "error",
        }
    }

    /// States in which a driver operation is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            HubState::Installing | HubState::Stopping | HubState::Uninstalling
        )
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationKind / OperationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Upgrade,
    Uninstall,
    NamespaceDelete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Upgrade => "upgrade",
            OperationKind::Uninstall => "uninstall",
            OperationKind::NamespaceDelete => "namespace_delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transitions: `Pending → Running → Succeeded | Failed`
///
/// The controller writes `Running` once a worker slot is acquired. On
/// restart, anything still `Pending` or `Running` is recovered to `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed { diagnostic: String },
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Running => "running",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A single tracked attempt to change a hub's deployed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub hub_id: HubId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Driver attempts made so far, including retries of transient failures.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(hub_id: HubId, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            hub_id,
            kind,
            status: OperationStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match &self.status {
            OperationStatus::Failed { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    /// `repo/chart`, a local path, or an `oci://` reference.
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hub {
    pub id: HubId,
    pub name: String,
    pub owner: String,
    pub namespace: String,
    pub release_name: String,
    pub chart: ChartRef,
    #[serde(default)]
    pub description: String,
    pub state: HubState,
    /// Sanitized override values applied to the release.
    #[serde(default)]
    pub values: serde_json::Value,
    /// Override fields stripped or rewritten at creation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit: Vec<AuditEntry>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hub {
    /// Labels stamped onto the hub's namespace.
    pub fn namespace_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("jupytercluster.io/managed".to_string(), "true".to_string()),
            ("jupytercluster.io/hub".to_string(), self.name.clone()),
            ("jupytercluster.io/owner".to_string(), label_safe(&self.owner)),
        ])
    }
}

/// Hub as returned to callers: the record plus its in-flight operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubRecord {
    #[serde(flatten)]
    pub hub: Hub,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_operation: Option<Operation>,
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// An authenticated identity issuing lifecycle intents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub admin: bool,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: false,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: true,
        }
    }
}

// ---------------------------------------------------------------------------
// HubEvent
// ---------------------------------------------------------------------------

/// Broadcast on every persisted hub state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub hub_id: HubId,
    pub name: String,
    pub state: HubState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_RELEASE_LEN: usize = 53;

/// Namespace and release name derived from a hub name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubIdentity {
    pub namespace: String,
    pub release_name: String,
}

impl HubIdentity {
    /// Derive and validate the identity for `name`.
    ///
    /// Both results must be valid DNS-1123 labels; helm additionally caps
    /// release names at 53 characters.
    pub fn derive(name: &str, namespace_prefix: &str, release_prefix: &str) -> Result<Self> {
        if !DNS_LABEL.is_match(name) {
            return Err(ClusterError::Validation(format!(
                "invalid hub name '{name}': must be lowercase alphanumeric with hyphens"
            )));
        }
        let namespace = format!("{namespace_prefix}{name}");
        if namespace.len() > MAX_NAMESPACE_LEN || !DNS_LABEL.is_match(&namespace) {
            return Err(ClusterError::Validation(format!(
                "invalid namespace '{namespace}': must be a DNS label of at most {MAX_NAMESPACE_LEN} characters"
            )));
        }
        let release_name = format!("{release_prefix}{name}");
        if release_name.len() > MAX_RELEASE_LEN || !DNS_LABEL.is_match(&release_name) {
            return Err(ClusterError::Validation(format!(
                "invalid release name '{release_name}': must be a DNS label of at most {MAX_RELEASE_LEN} characters"
            )));
        }
        Ok(Self {
            namespace,
            release_name,
        })
    }
}

/// Label values allow `[A-Za-z0-9_.-]`, at most 63 characters, and must
/// begin and end with an alphanumeric.
fn label_safe(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped
        .trim_start_matches(['-', '_', '.'])
        .chars()
        .take(63)
        .collect::<String>()
        .trim_end_matches(['-', '_', '.'])
        .to_string()
}
