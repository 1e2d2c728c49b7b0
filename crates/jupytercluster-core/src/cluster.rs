//! Kubernetes namespace and service access.
//!
//! `KubeCluster` talks to a real API server through kube-rs; the client is
//! built lazily on first use so that commands which never touch the
//! cluster do not need a kubeconfig. `InMemoryCluster` backs tests and the
//! `in_memory` backend.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};

/// Service created by the hub chart in front of the notebook proxy.
pub const PROXY_SERVICE: &str = "proxy-public";

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// A namespace that is still terminating counts as existing.
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create `name` with `labels`. An existing namespace is not an error.
    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;

    /// Request deletion. A missing namespace is not an error.
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Access URL of the hub deployed in `namespace`, if discoverable.
    async fn hub_url(&self, namespace: &str) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// KubeCluster
// ---------------------------------------------------------------------------

pub struct KubeCluster {
    kubeconfig: Option<PathBuf>,
    client: OnceCell<Client>,
}

impl KubeCluster {
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubeconfig,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .get_or_try_init(|| async {
                let config = match &self.kubeconfig {
                    Some(path) => {
                        let kubeconfig = kube::config::Kubeconfig::read_from(path)
                            .map_err(|e| ClusterError::Config(format!("kubeconfig: {e}")))?;
                        kube::Config::from_custom_kubeconfig(
                            kubeconfig,
                            &kube::config::KubeConfigOptions::default(),
                        )
                        .await
                        .map_err(|e| ClusterError::Config(format!("kubeconfig: {e}")))?
                    }
                    None => kube::Config::infer()
                        .await
                        .map_err(|e| ClusterError::Config(format!("kubernetes config: {e}")))?,
                };
                Client::try_from(config).map_err(kube_err)
            })
            .await
            .cloned()
    }
}

fn kube_err(e: kube::Error) -> ClusterError {
    match &e {
        kube::Error::Api(resp) if resp.code == 429 || resp.code >= 500 => {
            ClusterError::TransientInfra(format!("{} ({})", resp.message, resp.code))
        }
        kube::Error::Api(resp) => {
            ClusterError::Infra(format!("{} ({})", resp.message, resp.code))
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => {
            ClusterError::TransientInfra(e.to_string())
        }
        _ => ClusterError::Infra(e.to_string()),
    }
}

fn is_status(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let found = api.get_opt(name).await.map_err(kube_err)?;
        Ok(found.is_some())
    }

    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = name, "namespace created");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => {
                debug!(namespace = name, "namespace already exists");
                Ok(())
            }
            Err(e) => Err(kube_err(e)),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = name, "namespace deletion requested");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(kube_err(e)),
        }
    }

    async fn hub_url(&self, namespace: &str) -> Result<Option<String>> {
        let client = self.client().await?;

        // An ingress host wins over the in-cluster service name.
        let ingresses: Api<Ingress> = Api::namespaced(client.clone(), namespace);
        let list = ingresses
            .list(&ListParams::default())
            .await
            .map_err(kube_err)?;
        let host = list
            .items
            .iter()
            .filter_map(|ing| ing.spec.as_ref()?.rules.as_ref()?.first()?.host.clone())
            .next();
        if let Some(host) = host {
            return Ok(Some(format!("https://{host}")));
        }

        let services: Api<Service> = Api::namespaced(client, namespace);
        let proxy = services.get_opt(PROXY_SERVICE).await.map_err(kube_err)?;
        Ok(proxy.map(|_| service_url(namespace)))
    }
}

pub fn service_url(namespace: &str) -> String {
    format!("http://{PROXY_SERVICE}.{namespace}.svc.cluster.local")
}

// ---------------------------------------------------------------------------
// InMemoryCluster
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ClusterState {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    deleted: Vec<String>,
    /// Namespaces whose deletion never completes.
    stuck: BTreeSet<String>,
    /// Number of upcoming calls that fail with a transient error.
    transient_failures: u32,
    unreachable: bool,
}

/// Namespaces held in memory. The hub URL is the proxy service name of
/// any existing namespace.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    calls: AtomicU32,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| ClusterError::Infra("in-memory cluster poisoned".into()))
    }

    /// Record a call and apply any injected failure.
    fn enter(&self) -> Result<std::sync::MutexGuard<'_, ClusterState>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock()?;
        if state.unreachable {
            return Err(ClusterError::Infra("cluster unreachable".into()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ClusterError::TransientInfra("connection refused".into()));
        }
        Ok(state)
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_transiently(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.transient_failures = n;
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable = unreachable;
        }
    }

    /// Make deletion of `name` hang forever.
    pub fn stick_deletion(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.stuck.insert(name.to_string());
        }
    }

    pub fn insert_namespace(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.namespaces.insert(name.to_string(), BTreeMap::new());
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.namespaces.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.namespaces.get(name).cloned())
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.deleted.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter()?;
        Ok(state.namespaces.contains_key(name))
    }

    async fn create_namespace(&self, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.enter()?;
        state
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter()?;
        if state.stuck.contains(name) {
            return Ok(());
        }
        if state.namespaces.remove(name).is_some() {
            state.deleted.push(name.to_string());
        }
        Ok(())
    }

    async fn hub_url(&self, namespace: &str) -> Result<Option<String>> {
        let state = self.enter()?;
        Ok(state
            .namespaces
            .contains_key(namespace)
            .then(|| service_url(namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_namespace_lifecycle() {
        let cluster = InMemoryCluster::new();
        let labels = BTreeMap::from([("jupytercluster.io/managed".to_string(), "true".to_string())]);

        assert!(!cluster.namespace_exists("jupyterhub-a").await.unwrap());
        cluster.create_namespace("jupyterhub-a", &labels).await.unwrap();
        assert!(cluster.namespace_exists("jupyterhub-a").await.unwrap());
        assert_eq!(cluster.labels("jupyterhub-a").unwrap(), labels);
        assert_eq!(
            cluster.hub_url("jupyterhub-a").await.unwrap().as_deref(),
            Some("http://proxy-public.jupyterhub-a.svc.cluster.local")
        );

        cluster.delete_namespace("jupyterhub-a").await.unwrap();
        cluster.delete_namespace("jupyterhub-a").await.unwrap();
        assert!(!cluster.namespace_exists("jupyterhub-a").await.unwrap());
        assert_eq!(cluster.deleted(), vec!["jupyterhub-a".to_string()]);
        assert!(cluster.hub_url("jupyterhub-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures() {
        let cluster = InMemoryCluster::new();
        cluster.fail_transiently(2);
        assert!(cluster.namespace_exists("x").await.unwrap_err().is_transient());
        assert!(cluster.namespace_exists("x").await.unwrap_err().is_transient());
        assert!(cluster.namespace_exists("x").await.is_ok());
        assert_eq!(cluster.calls(), 3);

        cluster.set_unreachable(true);
        let err = cluster.namespace_exists("x").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn stuck_deletion_keeps_namespace() {
        let cluster = InMemoryCluster::new();
        cluster.insert_namespace("jupyterhub-stuck");
        cluster.stick_deletion("jupyterhub-stuck");
        cluster.delete_namespace("jupyterhub-stuck").await.unwrap();
        assert!(cluster.namespace_exists("jupyterhub-stuck").await.unwrap());
    }
}
