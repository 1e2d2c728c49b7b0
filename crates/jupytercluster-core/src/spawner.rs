//! Deploys and removes hub releases: namespace handling around helm.
//!
//! Every step is bounded. When helm times out, the spawner performs
//! best-effort compensating cleanup and reports what it did in the
//! returned `ClusterError::Timeout`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::config::RepositoryConfig;
use crate::driver::{HelmCompletion, HelmDriver};
use crate::error::{ClusterError, Result};
use crate::lock::CancelSignal;
use crate::retry::RetryPolicy;
use crate::types::{ChartRef, Hub};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where a hub is deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubTarget {
    pub name: String,
    pub namespace: String,
    pub release_name: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&Hub> for HubTarget {
    fn from(hub: &Hub) -> Self {
        Self {
            name: hub.name.clone(),
            namespace: hub.namespace.clone(),
            release_name: hub.release_name.clone(),
            labels: hub.namespace_labels(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// The release already existed and was upgraded in place.
    pub upgraded: bool,
    pub url: Option<String>,
}

pub struct HubSpawner {
    cluster: Arc<dyn ClusterApi>,
    helm: HelmDriver,
    retry: RetryPolicy,
    allow_namespace_creation: bool,
    repository: Option<RepositoryConfig>,
    poll_interval: Duration,
}

impl HubSpawner {
    pub fn new(cluster: Arc<dyn ClusterApi>, helm: HelmDriver) -> Self {
        Self {
            cluster,
            helm,
            retry: RetryPolicy::default(),
            allow_namespace_creation: true,
            repository: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_namespace_creation(mut self, allow: bool) -> Self {
        self.allow_namespace_creation = allow;
        self
    }

    pub fn with_repository(mut self, repository: Option<RepositoryConfig>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Install or upgrade the hub's release.
    ///
    /// `attempts` counts helm install attempts, including retries.
    pub async fn install(
        &self,
        target: &HubTarget,
        chart: &ChartRef,
        values: &serde_json::Value,
        timeout: Duration,
        cancel: &CancelSignal,
        attempts: &mut u32,
    ) -> Result<InstallReport> {
        check_cancel(cancel, target)?;
        self.ensure_repository(chart).await?;

        let created = self.ensure_namespace(target).await?;
        if cancel.is_cancelled() {
            if created {
                self.best_effort_namespace_delete(&target.namespace).await;
            }
            return Err(cancelled(target));
        }

        info!(
            hub = %target.name,
            namespace = %target.namespace,
            release = %target.release_name,
            chart = %chart.reference,
            "installing release"
        );
        let completion = self
            .retry
            .run("helm upgrade --install", attempts, |_| {
                self.helm.upgrade_install(
                    &target.release_name,
                    &target.namespace,
                    chart,
                    values,
                    timeout,
                )
            })
            .await?;

        match completion {
            HelmCompletion::Done { upgraded } => {
                let url = match self.cluster.hub_url(&target.namespace).await {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(hub = %target.name, error = %e, "hub url discovery failed");
                        None
                    }
                };
                info!(hub = %target.name, upgraded, url = ?url, "release deployed");
                Ok(InstallReport { upgraded, url })
            }
            HelmCompletion::TimedOut { diagnostic } => {
                warn!(
                    hub = %target.name,
                    release = %target.release_name,
                    %diagnostic,
                    "install timed out, cleaning up"
                );
                let mut cleanup = match self.uninstall_once(target, timeout).await {
                    Ok(()) => "release uninstalled".to_string(),
                    Err(e) => format!("release uninstall failed: {e}"),
                };
                if created {
                    cleanup.push_str(&self.best_effort_namespace_delete(&target.namespace).await);
                }
                Err(ClusterError::Timeout {
                    operation: format!("install {}", target.release_name),
                    after: timeout,
                    cleanup,
                })
            }
        }
    }

    /// Uninstall the hub's release. A missing release counts as success.
    pub async fn uninstall(
        &self,
        target: &HubTarget,
        timeout: Duration,
        attempts: &mut u32,
    ) -> Result<()> {
        info!(
            hub = %target.name,
            namespace = %target.namespace,
            release = %target.release_name,
            "uninstalling release"
        );
        let completion = self
            .retry
            .run("helm uninstall", attempts, |_| {
                self.helm
                    .uninstall(&target.release_name, &target.namespace, timeout)
            })
            .await?;
        match completion {
            HelmCompletion::Done { .. } => Ok(()),
            HelmCompletion::TimedOut { diagnostic } => {
                warn!(hub = %target.name, %diagnostic, "uninstall timed out, deleting namespace");
                let cleanup = self
                    .best_effort_namespace_delete(&target.namespace)
                    .await
                    .trim_start_matches("; ")
                    .to_string();
                Err(ClusterError::Timeout {
                    operation: format!("uninstall {}", target.release_name),
                    after: timeout,
                    cleanup,
                })
            }
        }
    }

    /// Delete `namespace` and wait until it is gone.
    pub async fn ensure_namespace_deleted(
        &self,
        namespace: &str,
        timeout: Duration,
        attempts: &mut u32,
    ) -> Result<()> {
        let started = Instant::now();
        self.retry
            .run("delete namespace", attempts, |_| {
                self.cluster.delete_namespace(namespace)
            })
            .await?;

        loop {
            let mut probes = 0;
            let exists = self
                .retry
                .run("namespace exists", &mut probes, |_| {
                    self.cluster.namespace_exists(namespace)
                })
                .await?;
            if !exists {
                info!(namespace, "namespace removed");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ClusterError::Timeout {
                    operation: format!("delete namespace {namespace}"),
                    after: timeout,
                    cleanup: "none; namespace still terminating".to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ensure_repository(&self, chart: &ChartRef) -> Result<()> {
        let Some(repo) = &self.repository else {
            return Ok(());
        };
        let prefix = format!("{}/", repo.name);
        if !chart.reference.starts_with(&prefix) {
            return Ok(());
        }
        let mut tries = 0;
        let completion = self
            .retry
            .run("helm repo add", &mut tries, |_| self.helm.repo_add(repo))
            .await?;
        match completion {
            HelmCompletion::Done { .. } => Ok(()),
            HelmCompletion::TimedOut { diagnostic } => Err(ClusterError::Infra(format!(
                "helm repo add {} timed out: {diagnostic}",
                repo.name
            ))),
        }
    }

    /// Returns true if this call created the namespace.
    async fn ensure_namespace(&self, target: &HubTarget) -> Result<bool> {
        let mut tries = 0;
        let exists = self
            .retry
            .run("namespace exists", &mut tries, |_| {
                self.cluster.namespace_exists(&target.namespace)
            })
            .await?;
        if exists {
            return Ok(false);
        }
        if !self.allow_namespace_creation {
            return Err(ClusterError::Infra(format!(
                "namespace {} does not exist and namespace creation is disabled",
                target.namespace
            )));
        }
        self.retry
            .run("create namespace", &mut tries, |_| {
                self.cluster
                    .create_namespace(&target.namespace, &target.labels)
            })
            .await?;
        Ok(true)
    }

    async fn uninstall_once(&self, target: &HubTarget, timeout: Duration) -> Result<()> {
        match self
            .helm
            .uninstall(&target.release_name, &target.namespace, timeout)
            .await?
        {
            HelmCompletion::Done { .. } => Ok(()),
            HelmCompletion::TimedOut { diagnostic } => Err(ClusterError::Infra(format!(
                "uninstall timed out: {diagnostic}"
            ))),
        }
    }

    /// Returns a `; ...` suffix describing the result for cleanup reports.
    async fn best_effort_namespace_delete(&self, namespace: &str) -> String {
        match self.cluster.delete_namespace(namespace).await {
            Ok(()) => "; namespace deletion requested".to_string(),
            Err(e) => {
                warn!(namespace, error = %e, "namespace cleanup failed");
                format!("; namespace deletion failed: {e}")
            }
        }
    }
}

fn cancelled(target: &HubTarget) -> ClusterError {
    ClusterError::Cancelled(format!("install of {} superseded", target.release_name))
}

fn check_cancel(cancel: &CancelSignal, target: &HubTarget) -> Result<()> {
    if cancel.is_cancelled() {
        Err(cancelled(target))
    } else {
        Ok(())
    }
}
