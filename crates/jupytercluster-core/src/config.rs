use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::registry::{ClusterBackend, DriverBackend};
use crate::sanitize::DEFAULT_ALLOWED_SECTIONS;
use crate::types::{Actor, ChartRef};

pub const CONFIG_FILE: &str = "jupytercluster.yaml";
pub const ALLOW_NAMESPACE_CREATION_ENV: &str = "JUPYTERCLUSTER_ALLOW_NAMESPACE_CREATION";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// ChartConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(default = "default_chart_reference")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Registered with `helm repo add` before installing.
    #[serde(default = "default_repository", skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryConfig>,
}

fn default_chart_reference() -> String {
    "jupyterhub/jupyterhub".to_string()
}

fn default_repository() -> Option<RepositoryConfig> {
    Some(RepositoryConfig {
        name: "jupyterhub".to_string(),
        url: "https://hub.jupyter.org/helm-chart/".to_string(),
    })
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            reference: default_chart_reference(),
            version: None,
            repository: default_repository(),
        }
    }
}

impl ChartConfig {
    pub fn chart_ref(&self) -> ChartRef {
        ChartRef {
            reference: self.reference.clone(),
            version: self.version.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutConfig / RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_start_secs")]
    pub start_secs: u64,
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_namespace_delete_secs")]
    pub namespace_delete_secs: u64,
}

fn default_start_secs() -> u64 {
    300
}

fn default_stop_secs() -> u64 {
    60
}

fn default_namespace_delete_secs() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_secs: default_start_secs(),
            stop_secs: default_stop_secs(),
            namespace_delete_secs: default_namespace_delete_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    pub fn namespace_delete(&self) -> Duration {
        Duration::from_secs(self.namespace_delete_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// SecurityConfig / BackendConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_allowed_sections")]
    pub allowed_sections: Vec<String>,
}

fn default_allowed_sections() -> Vec<String> {
    DEFAULT_ALLOWED_SECTIONS.iter().map(|s| s.to_string()).collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_sections: default_allowed_sections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_driver")]
    pub driver: DriverBackend,
    #[serde(default = "default_cluster")]
    pub cluster: ClusterBackend,
    #[serde(default = "default_helm_binary")]
    pub helm_binary: String,
    /// Empty means in-cluster config or the default kubeconfig.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

fn default_driver() -> DriverBackend {
    DriverBackend::Helm
}

fn default_cluster() -> ClusterBackend {
    ClusterBackend::Kubernetes
}

fn default_helm_binary() -> String {
    "helm".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            cluster: default_cluster(),
            helm_binary: default_helm_binary(),
            kubeconfig: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_prefix")]
    pub namespace_prefix: String,
    #[serde(default = "default_prefix")]
    pub release_prefix: String,
    #[serde(default)]
    pub chart: ChartConfig,
    /// Operator-supplied values merged under every hub's overrides.
    #[serde(default = "default_values", skip_serializing_if = "is_empty_mapping")]
    pub default_values: serde_json::Value,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_namespace_creation: bool,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Relative paths resolve against the config file's directory.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

fn default_version() -> u32 {
    1
}

fn default_prefix() -> String {
    "jupyterhub-".to_string()
}

fn default_values() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn is_empty_mapping(value: &serde_json::Value) -> bool {
    value.as_object().is_some_and(|m| m.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    4
}

fn default_state_path() -> PathBuf {
    PathBuf::from("jupytercluster.redb")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            namespace_prefix: default_prefix(),
            release_prefix: default_prefix(),
            chart: ChartConfig::default(),
            default_values: default_values(),
            admin_users: Vec::new(),
            allow_namespace_creation: true,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            max_concurrent_operations: default_max_concurrent(),
            security: SecurityConfig::default(),
            backend: BackendConfig::default(),
            state_path: default_state_path(),
        }
    }
}

impl Config {
    /// Load `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ClusterError::ConfigNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&data)?;
        cfg.apply_env(std::env::var(ALLOW_NAMESPACE_CREATION_ENV).ok().as_deref());
        if cfg.state_path.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.state_path = dir.join(&cfg.state_path);
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// The environment wins over the file for namespace creation.
    pub fn apply_env(&mut self, allow_namespace_creation: Option<&str>) {
        if let Some(raw) = allow_namespace_creation {
            self.allow_namespace_creation =
                matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    pub fn actor(&self, id: &str) -> Actor {
        Actor {
            id: id.to_string(),
            admin: self.admin_users.iter().any(|a| a == id),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Prefixes must keep derived names valid DNS labels.
        for (field, prefix) in [
            ("namespace_prefix", &self.namespace_prefix),
            ("release_prefix", &self.release_prefix),
        ] {
            let ok = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !prefix.starts_with('-');
            if !ok {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!(
                        "{field} '{prefix}' must be non-empty lowercase alphanumeric with hyphens"
                    ),
                });
            }
        }

        // 2. Zero timeouts would fail every operation immediately.
        for (field, secs) in [
            ("timeouts.start_secs", self.timeouts.start_secs),
            ("timeouts.stop_secs", self.timeouts.stop_secs),
            ("timeouts.namespace_delete_secs", self.timeouts.namespace_delete_secs),
        ] {
            if secs == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{field} must be greater than zero"),
                });
            }
        }

        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        } else if self.retry.max_attempts > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "retry.max_attempts={} (>10 is unusual)",
                    self.retry.max_attempts
                ),
            });
        }

        if self.max_concurrent_operations == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "max_concurrent_operations must be at least 1".to_string(),
            });
        }

        // 3. Sections outside the built-in list widen the attack surface.
        for section in &self.security.allowed_sections {
            if !DEFAULT_ALLOWED_SECTIONS.contains(&section.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "security.allowed_sections includes non-default section '{section}'"
                    ),
                });
            }
        }

        if !self.default_values.is_object() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "default_values must be a mapping".to_string(),
            });
        }

        if self.admin_users.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "no admin_users configured".to_string(),
            });
        }

        if self.backend.driver == DriverBackend::Helm
            && which::which(&self.backend.helm_binary).is_err()
        {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!("helm binary '{}' not found on PATH", self.backend.helm_binary),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
