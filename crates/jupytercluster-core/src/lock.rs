//! Per-hub execution leases.
//!
//! A lease is held from the moment an intent is accepted until its
//! background work (including any chained or queued follow-up operation)
//! has been settled. A second intent for a held hub is a conflict, unless
//! it preempts: the preempting operation is queued on the lease, the
//! current holder's cancel signal fires, and the holder runs the queued
//! operation before releasing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{ClusterError, Result};
use crate::types::{HubId, Operation};

struct Slot {
    cancel: watch::Sender<bool>,
    followup: Option<Operation>,
}

struct Inner {
    slots: Mutex<HashMap<HubId, Slot>>,
    /// Bumped on every release so `wait_idle` can re-check.
    released: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

/// Outcome of `LockManager::preempt`.
pub enum Preempted<T> {
    /// The hub was idle; the caller now holds the lease and must run
    /// `operation` itself.
    Acquired {
        lease: HubLease,
        value: T,
        operation: Operation,
    },
    /// The operation was queued on the current holder's lease.
    Queued { value: T },
    /// The supersede step decided there was nothing to do.
    Unchanged,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                released,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<HubId, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lease(&self, hub_id: HubId, cancel: watch::Receiver<bool>) -> HubLease {
        HubLease {
            hub_id,
            locks: self.clone(),
            cancel: CancelSignal(cancel),
            released: false,
        }
    }

    pub fn try_acquire(&self, hub_id: HubId) -> Result<HubLease> {
        self.acquire_with(hub_id, || Ok(())).map(|(lease, ())| lease)
    }

    /// Take the lease and run `begin` under the lease table, so no
    /// `preempt` can observe the lease before `begin` has committed.
    ///
    /// If `begin` fails the lease is never handed out.
    pub fn acquire_with<T>(
        &self,
        hub_id: HubId,
        begin: impl FnOnce() -> Result<T>,
    ) -> Result<(HubLease, T)> {
        let mut slots = self.slots();
        if slots.contains_key(&hub_id) {
            return Err(ClusterError::Conflict(format!(
                "hub {hub_id} has an operation in progress"
            )));
        }
        let value = begin()?;
        let (cancel, rx) = watch::channel(false);
        slots.insert(
            hub_id,
            Slot {
                cancel,
                followup: None,
            },
        );
        drop(slots);
        Ok((self.lease(hub_id, rx), value))
    }

    /// Run `supersede` while holding the lease table, then either take the
    /// lease or hand the resulting operation to the current holder.
    ///
    /// The holder cannot release between `supersede` and the hand-over, so
    /// a queued operation is never dropped.
    pub fn preempt<T>(
        &self,
        hub_id: HubId,
        supersede: impl FnOnce() -> Result<Option<(T, Operation)>>,
    ) -> Result<Preempted<T>> {
        let mut slots = self.slots();
        let Some((value, operation)) = supersede()? else {
            return Ok(Preempted::Unchanged);
        };
        match slots.get_mut(&hub_id) {
            Some(slot) => {
                slot.followup = Some(operation);
                slot.cancel.send_replace(true);
                Ok(Preempted::Queued { value })
            }
            None => {
                let (cancel, rx) = watch::channel(false);
                slots.insert(
                    hub_id,
                    Slot {
                        cancel,
                        followup: None,
                    },
                );
                drop(slots);
                Ok(Preempted::Acquired {
                    lease: self.lease(hub_id, rx),
                    value,
                    operation,
                })
            }
        }
    }

    pub fn is_held(&self, hub_id: HubId) -> bool {
        self.slots().contains_key(&hub_id)
    }

    /// Resolve once no lease is held for `hub_id`.
    pub async fn wait_idle(&self, hub_id: HubId) {
        let mut rx = self.inner.released.subscribe();
        loop {
            if !self.is_held(hub_id) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn release(&self, hub_id: HubId) {
        self.slots().remove(&hub_id);
        self.inner.released.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Exclusive right to run operations for one hub.
pub struct HubLease {
    hub_id: HubId,
    locks: LockManager,
    cancel: CancelSignal,
    released: bool,
}

impl HubLease {
    pub fn hub_id(&self) -> HubId {
        self.hub_id
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Take a queued follow-up operation, or release the lease if there is
    /// none. The cancel signal is reset before the follow-up runs.
    pub fn finish(&mut self) -> Option<Operation> {
        if self.released {
            return None;
        }
        {
            let mut slots = self.locks.slots();
            if let Some(slot) = slots.get_mut(&self.hub_id) {
                if let Some(next) = slot.followup.take() {
                    slot.cancel.send_replace(false);
                    return Some(next);
                }
            }
        }
        self.released = true;
        self.locks.release(self.hub_id);
        None
    }
}

impl Drop for HubLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.locks.release(self.hub_id);
        }
    }
}

/// Read side of a lease's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn second_acquire_conflicts_until_release() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let mut lease = locks.try_acquire(hub).unwrap();
        assert!(matches!(
            locks.try_acquire(hub),
            Err(ClusterError::Conflict(_))
        ));
        assert!(locks.try_acquire(Uuid::new_v4()).is_ok());

        assert!(lease.finish().is_none());
        assert!(!locks.is_held(hub));
        assert!(locks.try_acquire(hub).is_ok());
    }

    #[test]
    fn failed_begin_leaves_hub_unleased() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let err = locks
            .acquire_with::<()>(hub, || Err(ClusterError::Conflict("busy".into())))
            .err()
            .unwrap();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(!locks.is_held(hub));

        // With nothing held, a preempting delete takes the lease itself.
        let outcome = locks
            .preempt(hub, || {
                Ok(Some(((), Operation::new(hub, OperationKind::Uninstall))))
            })
            .unwrap();
        assert!(matches!(outcome, Preempted::Acquired { .. }));
    }

    #[test]
    fn begin_runs_only_when_free() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let (_lease, value) = locks.acquire_with(hub, || Ok(7)).unwrap();
        assert_eq!(value, 7);

        let mut ran = false;
        let second = locks.acquire_with(hub, || {
            ran = true;
            Ok(())
        });
        assert!(matches!(second, Err(ClusterError::Conflict(_))));
        assert!(!ran);
    }

    #[test]
    fn drop_releases() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        {
            let _lease = locks.try_acquire(hub).unwrap();
            assert!(locks.is_held(hub));
        }
        assert!(!locks.is_held(hub));
    }

    #[test]
    fn preempt_queues_on_holder_and_cancels() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let mut lease = locks.try_acquire(hub).unwrap();
        let cancel = lease.cancel_signal();
        assert!(!cancel.is_cancelled());

        let uninstall = Operation::new(hub, OperationKind::Uninstall);
        let queued_id = uninstall.id;
        let outcome = locks
            .preempt(hub, || Ok(Some(((), uninstall))))
            .unwrap();
        assert!(matches!(outcome, Preempted::Queued { .. }));
        assert!(cancel.is_cancelled());

        let next = lease.finish().unwrap();
        assert_eq!(next.id, queued_id);
        assert!(!cancel.is_cancelled());
        assert!(locks.is_held(hub));

        assert!(lease.finish().is_none());
        assert!(!locks.is_held(hub));
    }

    #[test]
    fn preempt_acquires_idle_hub() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let outcome = locks
            .preempt(hub, || {
                Ok(Some(("hub", Operation::new(hub, OperationKind::Uninstall))))
            })
            .unwrap();
        let Preempted::Acquired { lease, value, .. } = outcome else {
            panic!("expected Acquired");
        };
        assert_eq!(value, "hub");
        assert!(locks.is_held(hub));
        drop(lease);
        assert!(!locks.is_held(hub));
    }

    #[test]
    fn preempt_unchanged_leaves_lease_alone() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let lease = locks.try_acquire(hub).unwrap();
        let outcome = locks.preempt::<()>(hub, || Ok(None)).unwrap();
        assert!(matches!(outcome, Preempted::Unchanged));
        assert!(!lease.cancel_signal().is_cancelled());
    }

    #[tokio::test]
    async fn wait_idle_resolves_on_release() {
        let locks = LockManager::new();
        let hub = Uuid::new_v4();
        let mut lease = locks.try_acquire(hub).unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.wait_idle(hub).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lease.finish();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
