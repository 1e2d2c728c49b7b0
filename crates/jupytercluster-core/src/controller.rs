//! Hub lifecycle state machine.
//!
//! Intents are validated, authorized and persisted synchronously; the
//! driver work runs in a background task bounded by a global worker pool.
//!
//! ```text
//! intent ─▶ authorize ─▶ lease ─▶ store txn (state + operation) ─▶ ack
//!                                      │
//!                      worker permit ◀─┘
//!                           │
//!                      HubSpawner ─▶ store txn (settle) ─▶ event ─▶ release
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

use crate::access::AccessControl;
use crate::config::Config;
use crate::error::{ClusterError, Result};
use crate::lock::{HubLease, LockManager, Preempted};
use crate::registry::BackendRegistry;
use crate::retry::RetryPolicy;
use crate::sanitize::{render_values, SecurityValidator};
use crate::spawner::{HubSpawner, HubTarget};
use crate::store::{OperationResult, Settled, StateStore};
use crate::types::{
    Actor, ChartRef, Hub, HubEvent, HubId, HubIdentity, HubRecord, HubState, Operation,
    OperationKind,
};

pub const FORCED_DELETE_DIAGNOSTIC: &str = "cancelled by forced delete";

const EVENT_CAPACITY: usize = 256;
const STARTABLE: &[HubState] = &[HubState::Created, HubState::Stopped, HubState::Error];
const DELETABLE: &[HubState] = &[
    HubState::Created,
    HubState::Running,
    HubState::Stopped,
    HubState::Error,
];

// ---------------------------------------------------------------------------
// ControllerSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub namespace_prefix: String,
    pub release_prefix: String,
    pub chart: ChartRef,
    pub default_values: serde_json::Value,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub namespace_delete_timeout: Duration,
    pub max_concurrent_operations: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ControllerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            namespace_prefix: cfg.namespace_prefix.clone(),
            release_prefix: cfg.release_prefix.clone(),
            chart: cfg.chart.chart_ref(),
            default_values: cfg.default_values.clone(),
            start_timeout: cfg.timeouts.start(),
            stop_timeout: cfg.timeouts.stop(),
            namespace_delete_timeout: cfg.timeouts.namespace_delete(),
            max_concurrent_operations: cfg.max_concurrent_operations,
        }
    }
}

// ---------------------------------------------------------------------------
// LifecycleController
// ---------------------------------------------------------------------------

struct Inner {
    store: StateStore,
    spawner: HubSpawner,
    access: AccessControl,
    validator: SecurityValidator,
    locks: LockManager,
    pool: Semaphore,
    settings: ControllerSettings,
    events: broadcast::Sender<HubEvent>,
}

#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(
        store: StateStore,
        spawner: HubSpawner,
        validator: SecurityValidator,
        settings: ControllerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                spawner,
                access: AccessControl,
                validator,
                locks: LockManager::new(),
                pool: Semaphore::new(settings.max_concurrent_operations.max(1)),
                settings,
                events,
            }),
        }
    }

    /// Open the state store and resolve backends from `cfg`.
    pub fn from_config(cfg: &Config, registry: &BackendRegistry) -> Result<Self> {
        let store = StateStore::open(&cfg.state_path)?;
        let backends = registry.resolve(&cfg.backend)?;
        let spawner = HubSpawner::new(Arc::clone(&backends.cluster), backends.helm())
            .with_retry(RetryPolicy::from(&cfg.retry))
            .with_namespace_creation(cfg.allow_namespace_creation)
            .with_repository(cfg.chart.repository.clone());
        let validator = SecurityValidator::new(cfg.security.allowed_sections.iter().cloned());
        Ok(Self::new(
            store,
            spawner,
            validator,
            ControllerSettings::from_config(cfg),
        ))
    }

    /// Fail operations interrupted by a previous crash. Call once at startup.
    pub fn recover(&self) -> Result<u32> {
        let count = self.inner.store.startup_recovery()?;
        if count > 0 {
            warn!(count, "recovered interrupted operations");
        }
        Ok(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once no work is in flight for the hub.
    pub async fn wait_idle(&self, id: HubId) {
        self.inner.locks.wait_idle(id).await;
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    pub async fn create_hub(
        &self,
        actor: &Actor,
        name: &str,
        overrides: &serde_json::Value,
        description: &str,
    ) -> Result<HubId> {
        let inner = &self.inner;
        let identity = HubIdentity::derive(
            name,
            &inner.settings.namespace_prefix,
            &inner.settings.release_prefix,
        )?;
        if inner.store.find_hub_by_name(name)?.is_some() {
            return Err(ClusterError::Conflict(format!("hub '{name}' already exists")));
        }
        let sanitized = inner.validator.sanitize(overrides, &identity)?;

        let now = Utc::now();
        let hub = Hub {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            owner: actor.id.clone(),
            namespace: identity.namespace,
            release_name: identity.release_name,
            chart: inner.settings.chart.clone(),
            description: description.to_string(),
            state: HubState::Created,
            values: sanitized.values,
            audit: sanitized.audit,
            url: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        inner.store.insert_hub(&hub)?;
        info!(
            hub = %hub.name,
            owner = %hub.owner,
            namespace = %hub.namespace,
            stripped = hub.audit.len(),
            "hub created"
        );
        inner.emit(&hub, None);
        Ok(hub.id)
    }

    pub async fn start_hub(&self, actor: &Actor, id: HubId) -> Result<HubState> {
        let inner = &self.inner;
        let hub = inner.load(id)?;
        inner.access.require_mutate(actor, &hub)?;
        let kind = match hub.state {
            HubState::Running => return Ok(HubState::Running),
            HubState::Error => OperationKind::Upgrade,
            HubState::Created | HubState::Stopped => OperationKind::Install,
            other => {
                return Err(ClusterError::Conflict(format!(
                    "cannot start hub '{}' in state {other}",
                    hub.name
                )))
            }
        };
        let (lease, (hub, op)) = inner.locks.acquire_with(id, || {
            inner
                .store
                .begin_operation(id, kind, STARTABLE, HubState::Installing)
        })?;
        inner.emit(&hub, Some(op.kind));
        self.dispatch(lease, op);
        Ok(hub.state)
    }

    pub async fn stop_hub(&self, actor: &Actor, id: HubId) -> Result<HubState> {
        let inner = &self.inner;
        let hub = inner.load(id)?;
        inner.access.require_mutate(actor, &hub)?;
        match hub.state {
            HubState::Stopped => return Ok(HubState::Stopped),
            HubState::Running => {}
            other => {
                return Err(ClusterError::Conflict(format!(
                    "cannot stop hub '{}' in state {other}",
                    hub.name
                )))
            }
        }
        let (lease, (hub, op)) = inner.locks.acquire_with(id, || {
            inner.store.begin_operation(
                id,
                OperationKind::Uninstall,
                &[HubState::Running],
                HubState::Stopping,
            )
        })?;
        inner.emit(&hub, Some(op.kind));
        self.dispatch(lease, op);
        Ok(hub.state)
    }

    /// Begin removing the hub: uninstall the release, then delete the
    /// namespace and the record.
    ///
    /// With `force`, an in-flight install or stop is superseded and the
    /// uninstall is queued to run as soon as the current driver call ends.
    pub async fn delete_hub(&self, actor: &Actor, id: HubId, force: bool) -> Result<HubState> {
        let inner = &self.inner;
        let hub = inner.load(id)?;
        inner.access.require_mutate(actor, &hub)?;
        match hub.state {
            HubState::Deleted => return Err(ClusterError::NotFound(hub.name)),
            HubState::Uninstalling if force => return self.resume_removal(&hub),
            state if state.is_transitional() && !force => {
                return Err(ClusterError::Conflict(format!(
                    "hub '{}' is {state}; retry later or force the delete",
                    hub.name
                )))
            }
            _ => {}
        }

        if !force {
            let (lease, (hub, op)) = inner.locks.acquire_with(id, || {
                inner.store.begin_operation(
                    id,
                    OperationKind::Uninstall,
                    DELETABLE,
                    HubState::Uninstalling,
                )
            })?;
            inner.emit(&hub, Some(op.kind));
            self.dispatch(lease, op);
            return Ok(hub.state);
        }

        warn!(hub = %hub.name, state = %hub.state, "forced delete");
        let outcome = inner.locks.preempt(id, || {
            let current = inner.load(id)?;
            if current.state == HubState::Uninstalling {
                return Ok(None);
            }
            let (hub, op) = inner.store.supersede_operation(
                id,
                OperationKind::Uninstall,
                HubState::Uninstalling,
                FORCED_DELETE_DIAGNOSTIC,
            )?;
            Ok(Some((hub, op)))
        })?;
        match outcome {
            Preempted::Acquired {
                lease,
                value: hub,
                operation,
            } => {
                inner.emit(&hub, Some(operation.kind));
                self.dispatch(lease, operation);
            }
            Preempted::Queued { value: hub } => {
                info!(hub = %hub.name, "uninstall queued behind in-flight operation");
                inner.emit(&hub, Some(OperationKind::Uninstall));
            }
            Preempted::Unchanged => {}
        }
        Ok(HubState::Uninstalling)
    }

    /// Forced delete of a hub already `Uninstalling`: a no-op while its
    /// work is in flight, otherwise re-dispatch the stranded operation.
    fn resume_removal(&self, hub: &Hub) -> Result<HubState> {
        let inner = &self.inner;
        let resumed = inner.locks.acquire_with(hub.id, || {
            match inner.store.active_operation(hub.id)? {
                Some(op) if !op.status.is_terminal() => Ok(op),
                _ => inner
                    .store
                    .supersede_operation(
                        hub.id,
                        OperationKind::Uninstall,
                        HubState::Uninstalling,
                        FORCED_DELETE_DIAGNOSTIC,
                    )
                    .map(|(_, op)| op),
            }
        });
        match resumed {
            Ok((lease, op)) => {
                warn!(hub = %hub.name, operation = %op.kind, "resuming stranded removal");
                inner.emit(hub, Some(op.kind));
                self.dispatch(lease, op);
            }
            Err(ClusterError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(HubState::Uninstalling)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_hub(&self, actor: &Actor, id: HubId) -> Result<HubRecord> {
        let inner = &self.inner;
        let hub = inner.load(id)?;
        inner.access.require_read(actor, &hub)?;
        inner.record(hub)
    }

    pub async fn list_hubs(&self, actor: &Actor) -> Result<Vec<HubRecord>> {
        let inner = &self.inner;
        let hubs = inner.store.list_hubs()?;
        inner
            .access
            .visible(actor, hubs)
            .into_iter()
            .map(|hub| inner.record(hub))
            .collect()
    }

    /// Operation history for a hub, oldest first.
    pub async fn operations(&self, actor: &Actor, id: HubId) -> Result<Vec<Operation>> {
        let inner = &self.inner;
        let hub = inner.load(id)?;
        inner.access.require_read(actor, &hub)?;
        inner.store.operations_for(id)
    }

    pub async fn find_hub(&self, name: &str) -> Result<Option<HubId>> {
        Ok(self.inner.store.find_hub_by_name(name)?.map(|hub| hub.id))
    }

    // -----------------------------------------------------------------------
    // Background execution
    // -----------------------------------------------------------------------

    fn dispatch(&self, lease: HubLease, op: Operation) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(lease, op).await });
    }
}

impl Inner {
    fn load(&self, id: HubId) -> Result<Hub> {
        self.store
            .get_hub(id)?
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }

    fn record(&self, hub: Hub) -> Result<HubRecord> {
        let active_operation = self.store.active_operation(hub.id)?;
        Ok(HubRecord {
            hub,
            active_operation,
        })
    }

    fn emit(&self, hub: &Hub, operation: Option<OperationKind>) {
        info!(
            hub = %hub.name,
            state = %hub.state,
            operation = operation.map(OperationKind::as_str),
            "hub state changed"
        );
        // No subscribers is fine.
        let _ = self.events.send(HubEvent {
            hub_id: hub.id,
            name: hub.name.clone(),
            state: hub.state,
            operation,
            at: hub.updated_at,
        });
    }

    /// Run `op` and everything chained or queued after it, then release.
    async fn drive(&self, mut lease: HubLease, mut op: Operation) {
        loop {
            let chained = match self.execute(&lease, op.clone()).await {
                Ok(next) => next,
                Err(e) => {
                    error!(hub_id = %lease.hub_id(), error = %e, "operation bookkeeping failed");
                    self.fail_unsettled(&op, &e);
                    None
                }
            };
            match chained.or_else(|| lease.finish()) {
                Some(next) => op = next,
                None => break,
            }
        }
    }

    /// Best-effort: fail `op` so the hub does not stay transitional. If
    /// this also fails, `recover()` at the next start clears it.
    fn fail_unsettled(&self, op: &Operation, cause: &ClusterError) {
        let result = OperationResult::Failed {
            diagnostic: cause.to_string(),
        };
        match self.store.settle(op, result) {
            Ok(Settled::Done { hub }) => self.emit(&hub, Some(op.kind)),
            Ok(_) => {}
            Err(e) => error!(operation = %op.id, error = %e, "could not fail operation"),
        }
    }

    async fn execute(&self, lease: &HubLease, op: Operation) -> Result<Option<Operation>> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|e| ClusterError::Infra(format!("worker pool closed: {e}")))?;

        let Some(mut op) = self.store.mark_running(&op)? else {
            info!(operation = %op.id, "operation superseded before it started");
            return Ok(None);
        };
        let Some(hub) = self.store.get_hub(op.hub_id)? else {
            return Ok(None);
        };
        let target = HubTarget::from(&hub);
        info!(
            hub = %hub.name,
            namespace = %hub.namespace,
            release = %hub.release_name,
            operation = %op.kind,
            "operation started"
        );

        let mut attempts = 0;
        let outcome = match op.kind {
            OperationKind::Install | OperationKind::Upgrade => {
                let values = render_values(&self.settings.default_values, &hub.values);
                self.spawner
                    .install(
                        &target,
                        &hub.chart,
                        &values,
                        self.settings.start_timeout,
                        &lease.cancel_signal(),
                        &mut attempts,
                    )
                    .await
                    .map(|report| OperationResult::Succeeded {
                        state: HubState::Running,
                        url: report.url,
                    })
            }
            OperationKind::Uninstall => {
                let stopping = hub.state == HubState::Stopping;
                self.spawner
                    .uninstall(&target, self.settings.stop_timeout, &mut attempts)
                    .await
                    .map(|()| {
                        if stopping {
                            OperationResult::Succeeded {
                                state: HubState::Stopped,
                                url: None,
                            }
                        } else {
                            OperationResult::Chained {
                                state: HubState::Uninstalling,
                                next: OperationKind::NamespaceDelete,
                            }
                        }
                    })
            }
            OperationKind::NamespaceDelete => self
                .spawner
                .ensure_namespace_deleted(
                    &hub.namespace,
                    self.settings.namespace_delete_timeout,
                    &mut attempts,
                )
                .await
                .map(|()| OperationResult::Removed),
        };
        op.attempts = attempts;

        let result = outcome.unwrap_or_else(|e| {
            error!(
                hub = %hub.name,
                operation = %op.kind,
                attempts,
                error = %e,
                "operation failed"
            );
            OperationResult::Failed {
                diagnostic: e.to_string(),
            }
        });

        match self.store.settle(&op, result)? {
            Settled::Stale => {
                info!(
                    hub = %hub.name,
                    operation = %op.kind,
                    "result of superseded operation discarded"
                );
                Ok(None)
            }
            Settled::Done { hub } => {
                self.emit(&hub, Some(op.kind));
                Ok(None)
            }
            Settled::Next { hub, operation } => {
                self.emit(&hub, Some(operation.kind));
                Ok(Some(operation))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
