//! Capability name to factory mapping, resolved once at startup.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterApi, InMemoryCluster, KubeCluster};
use crate::config::BackendConfig;
use crate::driver::{CommandRunner, DryRunRunner, HelmDriver, ProcessRunner};
use crate::error::{ClusterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverBackend {
    Helm,
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    Kubernetes,
    InMemory,
}

impl fmt::Display for DriverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverBackend::Helm => "helm",
            DriverBackend::DryRun => "dry_run",
        })
    }
}

impl fmt::Display for ClusterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClusterBackend::Kubernetes => "kubernetes",
            ClusterBackend::InMemory => "in_memory",
        })
    }
}

type RunnerFactory = Box<dyn Fn(&BackendConfig) -> Arc<dyn CommandRunner> + Send + Sync>;
type ClusterFactory = Box<dyn Fn(&BackendConfig) -> Arc<dyn ClusterApi> + Send + Sync>;

/// The strategies a running controller uses.
pub struct ResolvedBackends {
    pub runner: Arc<dyn CommandRunner>,
    pub cluster: Arc<dyn ClusterApi>,
    helm_binary: String,
    kubeconfig: Option<PathBuf>,
}

impl ResolvedBackends {
    pub fn helm(&self) -> HelmDriver {
        HelmDriver::new(Arc::clone(&self.runner), self.helm_binary.clone())
            .with_kubeconfig(self.kubeconfig.clone())
    }
}

pub struct BackendRegistry {
    drivers: HashMap<DriverBackend, RunnerFactory>,
    clusters: HashMap<ClusterBackend, ClusterFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
            clusters: HashMap::new(),
        }
    }

    /// Registry with every built-in backend.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_driver(DriverBackend::Helm, |_| Arc::new(ProcessRunner));
        registry.register_driver(DriverBackend::DryRun, |_| Arc::new(DryRunRunner::new()));
        registry.register_cluster(ClusterBackend::Kubernetes, |cfg| {
            Arc::new(KubeCluster::new(cfg.kubeconfig.clone()))
        });
        registry.register_cluster(ClusterBackend::InMemory, |_| {
            Arc::new(InMemoryCluster::new())
        });
        registry
    }

    pub fn register_driver<F>(&mut self, kind: DriverBackend, factory: F)
    where
        F: Fn(&BackendConfig) -> Arc<dyn CommandRunner> + Send + Sync + 'static,
    {
        self.drivers.insert(kind, Box::new(factory));
    }

    pub fn register_cluster<F>(&mut self, kind: ClusterBackend, factory: F)
    where
        F: Fn(&BackendConfig) -> Arc<dyn ClusterApi> + Send + Sync + 'static,
    {
        self.clusters.insert(kind, Box::new(factory));
    }

    pub fn resolve(&self, cfg: &BackendConfig) -> Result<ResolvedBackends> {
        let runner = self.drivers.get(&cfg.driver).ok_or_else(|| {
            ClusterError::Config(format!("no driver backend registered for '{}'", cfg.driver))
        })?;
        let cluster = self.clusters.get(&cfg.cluster).ok_or_else(|| {
            ClusterError::Config(format!(
                "no cluster backend registered for '{}'",
                cfg.cluster
            ))
        })?;
        Ok(ResolvedBackends {
            runner: runner(cfg),
            cluster: cluster(cfg),
            helm_binary: cfg.helm_binary.clone(),
            kubeconfig: cfg.kubeconfig.clone(),
        })
    }
}
