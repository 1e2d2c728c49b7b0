//! Durable hub and operation records using redb.
//!
//! # Table design
//!
//! ```text
//! hubs               hub id (16 bytes)  -> JSON Hub
//! hub_names          hub name           -> hub id
//! operations         op id (16 bytes)   -> JSON Operation
//! active_operations  hub id (16 bytes)  -> op id
//! ```
//!
//! A row in `active_operations` exists exactly while the hub has a
//! non-terminal operation. Every state-changing call below is one write
//! transaction, so the hub state and its operation never disagree on disk.

use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ClusterError, Result};
use crate::types::{Hub, HubId, HubState, Operation, OperationKind, OperationStatus};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const HUBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hubs");
const HUB_NAMES: TableDefinition<&str, &[u8]> = TableDefinition::new("hub_names");
const OPERATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("operations");
const ACTIVE_OPERATIONS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("active_operations");

pub const RECOVERY_DIAGNOSTIC: &str = "interrupted by restart";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Store(e.to_string())
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(db_err)
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<T>> {
    match table.get(key).map_err(db_err)? {
        Some(guard) => decode(guard.value()).map(Some),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    key: &[u8],
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(db_err)?;
    table.insert(key, bytes.as_slice()).map_err(db_err)?;
    Ok(())
}

fn active_id(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    hub_id: HubId,
) -> Result<Option<Uuid>> {
    match table.get(hub_id.as_bytes().as_slice()).map_err(db_err)? {
        Some(guard) => Uuid::from_slice(guard.value()).map(Some).map_err(db_err),
        None => Ok(None),
    }
}

fn hub_not_found(hub_id: HubId) -> ClusterError {
    ClusterError::NotFound(hub_id.to_string())
}

// ---------------------------------------------------------------------------
// Settle outcomes
// ---------------------------------------------------------------------------

/// How a finished operation changes its hub.
#[derive(Debug, Clone)]
pub enum OperationResult {
    /// Move to `state`; `url` replaces the stored URL.
    Succeeded {
        state: HubState,
        url: Option<String>,
    },
    /// Move to `state` and begin `next` in the same transaction.
    Chained {
        state: HubState,
        next: OperationKind,
    },
    /// Remove the hub record; the operation history stays.
    Removed,
    /// Move to `Error` with `diagnostic` as the hub's last error.
    Failed { diagnostic: String },
}

#[derive(Debug, Clone)]
pub enum Settled {
    /// The operation was already terminal (superseded or recovered).
    Stale,
    /// The hub after the change. A removed hub is reported as `Deleted`.
    Done { hub: Hub },
    Next { hub: Hub, operation: Operation },
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Open or create the database at `path` and ensure every table exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(HUBS).map_err(db_err)?;
        wt.open_table(HUB_NAMES).map_err(db_err)?;
        wt.open_table(OPERATIONS).map_err(db_err)?;
        wt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert a new hub. Fails with `Conflict` if the name is taken.
    pub fn insert_hub(&self, hub: &Hub) -> Result<()> {
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut names = wt.open_table(HUB_NAMES).map_err(db_err)?;
            if names.get(hub.name.as_str()).map_err(db_err)?.is_some() {
                return Err(ClusterError::Conflict(format!(
                    "hub '{}' already exists",
                    hub.name
                )));
            }
            names
                .insert(hub.name.as_str(), hub.id.as_bytes().as_slice())
                .map_err(db_err)?;
            let mut hubs = wt.open_table(HUBS).map_err(db_err)?;
            put_json(&mut hubs, hub.id.as_bytes(), hub)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_hub(&self, id: HubId) -> Result<Option<Hub>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let hubs = rt.open_table(HUBS).map_err(db_err)?;
        let hub = get_json(&hubs, id.as_bytes())?;
        Ok(hub)
    }

    pub fn find_hub_by_name(&self, name: &str) -> Result<Option<Hub>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let names = rt.open_table(HUB_NAMES).map_err(db_err)?;
        let id = match names.get(name).map_err(db_err)? {
            Some(guard) => Uuid::from_slice(guard.value()).map_err(db_err)?,
            None => return Ok(None),
        };
        let hubs = rt.open_table(HUBS).map_err(db_err)?;
        let hub = get_json(&hubs, id.as_bytes())?;
        Ok(hub)
    }

    /// All hubs, oldest first.
    pub fn list_hubs(&self) -> Result<Vec<Hub>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let hubs = rt.open_table(HUBS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in hubs.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(decode::<Hub>(v.value())?);
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    pub fn active_operation(&self, hub_id: HubId) -> Result<Option<Operation>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let active = rt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;
        let Some(op_id) = active_id(&active, hub_id)? else {
            return Ok(None);
        };
        let ops = rt.open_table(OPERATIONS).map_err(db_err)?;
        let op = get_json(&ops, op_id.as_bytes())?;
        Ok(op)
    }

    /// Operation history for a hub, oldest first. Survives hub removal.
    pub fn operations_for(&self, hub_id: HubId) -> Result<Vec<Operation>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let ops = rt.open_table(OPERATIONS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in ops.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let op: Operation = decode(v.value())?;
            if op.hub_id == hub_id {
                result.push(op);
            }
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    /// Move the hub from one of `allowed` into `next` and record a new
    /// pending operation.
    ///
    /// Fails with `Conflict` if the hub already has an active operation or
    /// is not in an allowed state.
    pub fn begin_operation(
        &self,
        hub_id: HubId,
        kind: OperationKind,
        allowed: &[HubState],
        next: HubState,
    ) -> Result<(Hub, Operation)> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = {
            let mut hubs = wt.open_table(HUBS).map_err(db_err)?;
            let mut ops = wt.open_table(OPERATIONS).map_err(db_err)?;
            let mut active = wt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;

            let mut hub: Hub =
                get_json(&hubs, hub_id.as_bytes())?.ok_or_else(|| hub_not_found(hub_id))?;
            if active_id(&active, hub_id)?.is_some() {
                return Err(ClusterError::Conflict(format!(
                    "hub '{}' already has an operation in progress",
                    hub.name
                )));
            }
            if !allowed.contains(&hub.state) {
                return Err(ClusterError::Conflict(format!(
                    "cannot {kind} hub '{}' in state {}",
                    hub.name, hub.state
                )));
            }

            let op = Operation::new(hub_id, kind);
            hub.state = next;
            hub.updated_at = op.created_at;
            put_json(&mut hubs, hub_id.as_bytes(), &hub)?;
            put_json(&mut ops, op.id.as_bytes(), &op)?;
            active
                .insert(hub_id.as_bytes().as_slice(), op.id.as_bytes().as_slice())
                .map_err(db_err)?;
            (hub, op)
        };
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Fail the hub's active operation (if any) with `reason` and begin
    /// `kind` in its place, moving the hub to `next`.
    pub fn supersede_operation(
        &self,
        hub_id: HubId,
        kind: OperationKind,
        next: HubState,
        reason: &str,
    ) -> Result<(Hub, Operation)> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = {
            let mut hubs = wt.open_table(HUBS).map_err(db_err)?;
            let mut ops = wt.open_table(OPERATIONS).map_err(db_err)?;
            let mut active = wt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;

            let mut hub: Hub =
                get_json(&hubs, hub_id.as_bytes())?.ok_or_else(|| hub_not_found(hub_id))?;
            let now = Utc::now();
            if let Some(prev_id) = active_id(&active, hub_id)? {
                if let Some(mut prev) = get_json::<Operation>(&ops, prev_id.as_bytes())? {
                    if !prev.status.is_terminal() {
                        prev.status = OperationStatus::Failed {
                            diagnostic: reason.to_string(),
                        };
                        prev.finished_at = Some(now);
                        put_json(&mut ops, prev_id.as_bytes(), &prev)?;
                    }
                }
            }

            let op = Operation::new(hub_id, kind);
            hub.state = next;
            hub.updated_at = now;
            put_json(&mut hubs, hub_id.as_bytes(), &hub)?;
            put_json(&mut ops, op.id.as_bytes(), &op)?;
            active
                .insert(hub_id.as_bytes().as_slice(), op.id.as_bytes().as_slice())
                .map_err(db_err)?;
            (hub, op)
        };
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Mark `op` running. Returns `None` if it was already settled elsewhere.
    pub fn mark_running(&self, op: &Operation) -> Result<Option<Operation>> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = {
            let mut ops = wt.open_table(OPERATIONS).map_err(db_err)?;
            let mut stored: Operation = get_json(&ops, op.id.as_bytes())?
                .ok_or_else(|| ClusterError::Store(format!("operation not found: {}", op.id)))?;
            if stored.status.is_terminal() {
                None
            } else {
                stored.status = OperationStatus::Running;
                stored.started_at = Some(Utc::now());
                put_json(&mut ops, op.id.as_bytes(), &stored)?;
                Some(stored)
            }
        };
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Finish `op` and apply `result` to its hub.
    ///
    /// An operation that is already terminal is left untouched and
    /// reported as `Settled::Stale`; the hub is not modified.
    pub fn settle(&self, op: &Operation, result: OperationResult) -> Result<Settled> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = {
            let mut hubs = wt.open_table(HUBS).map_err(db_err)?;
            let mut names = wt.open_table(HUB_NAMES).map_err(db_err)?;
            let mut ops = wt.open_table(OPERATIONS).map_err(db_err)?;
            let mut active = wt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;

            let mut stored: Operation = get_json(&ops, op.id.as_bytes())?
                .ok_or_else(|| ClusterError::Store(format!("operation not found: {}", op.id)))?;
            if stored.status.is_terminal() {
                return Ok(Settled::Stale);
            }
            let hub_key = op.hub_id.as_bytes();
            let mut hub: Hub = get_json(&hubs, hub_key)?.ok_or_else(|| hub_not_found(op.hub_id))?;

            let now = Utc::now();
            stored.attempts = op.attempts;
            stored.finished_at = Some(now);
            hub.updated_at = now;

            let settled = match result {
                OperationResult::Succeeded { state, url } => {
                    stored.status = OperationStatus::Succeeded;
                    hub.state = state;
                    hub.url = url;
                    hub.last_error = None;
                    active.remove(hub_key.as_slice()).map_err(db_err)?;
                    put_json(&mut hubs, hub_key, &hub)?;
                    Settled::Done { hub }
                }
                OperationResult::Chained { state, next } => {
                    stored.status = OperationStatus::Succeeded;
                    let operation = Operation::new(hub.id, next);
                    hub.state = state;
                    put_json(&mut ops, operation.id.as_bytes(), &operation)?;
                    active
                        .insert(hub_key.as_slice(), operation.id.as_bytes().as_slice())
                        .map_err(db_err)?;
                    put_json(&mut hubs, hub_key, &hub)?;
                    Settled::Next { hub, operation }
                }
                OperationResult::Removed => {
                    stored.status = OperationStatus::Succeeded;
                    hub.state = HubState::Deleted;
                    hub.url = None;
                    active.remove(hub_key.as_slice()).map_err(db_err)?;
                    hubs.remove(hub_key.as_slice()).map_err(db_err)?;
                    names.remove(hub.name.as_str()).map_err(db_err)?;
                    Settled::Done { hub }
                }
                OperationResult::Failed { diagnostic } => {
                    stored.status = OperationStatus::Failed {
                        diagnostic: diagnostic.clone(),
                    };
                    hub.state = HubState::Error;
                    hub.last_error = Some(diagnostic);
                    active.remove(hub_key.as_slice()).map_err(db_err)?;
                    put_json(&mut hubs, hub_key, &hub)?;
                    Settled::Done { hub }
                }
            };
            put_json(&mut ops, op.id.as_bytes(), &stored)?;
            settled
        };
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    /// On startup, fail every operation left non-terminal by a crash and
    /// move its hub to `Error`.
    ///
    /// Returns the number of operations recovered.
    pub fn startup_recovery(&self) -> Result<u32> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let count = {
            let mut hubs = wt.open_table(HUBS).map_err(db_err)?;
            let mut ops = wt.open_table(OPERATIONS).map_err(db_err)?;
            let mut active = wt.open_table(ACTIVE_OPERATIONS).map_err(db_err)?;

            let mut pairs = Vec::new();
            for entry in active.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                pairs.push((k.value().to_vec(), v.value().to_vec()));
            }

            let now = Utc::now();
            let mut count = 0u32;
            for (hub_key, op_key) in pairs {
                active.remove(hub_key.as_slice()).map_err(db_err)?;
                let Some(mut op) = get_json::<Operation>(&ops, &op_key)? else {
                    continue;
                };
                if op.status.is_terminal() {
                    continue;
                }
                op.status = OperationStatus::Failed {
                    diagnostic: RECOVERY_DIAGNOSTIC.to_string(),
                };
                op.finished_at = Some(now);
                put_json(&mut ops, &op_key, &op)?;
                if let Some(mut hub) = get_json::<Hub>(&hubs, &hub_key)? {
                    hub.state = HubState::Error;
                    hub.last_error = Some(format!("{} {RECOVERY_DIAGNOSTIC}", op.kind));
                    hub.updated_at = now;
                    put_json(&mut hubs, &hub_key, &hub)?;
                }
                count += 1;
            }
            count
        };
        wt.commit().map_err(db_err)?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
