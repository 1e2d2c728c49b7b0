use crate::error::{ClusterError, Result};
use crate::types::{Actor, Hub};

/// Ownership-scoped access: owners and admins may read and mutate a hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessControl;

impl AccessControl {
    pub fn can_read(&self, actor: &Actor, hub: &Hub) -> bool {
        actor.admin || actor.id == hub.owner
    }

    pub fn can_mutate(&self, actor: &Actor, hub: &Hub) -> bool {
        actor.admin || actor.id == hub.owner
    }

    pub fn require_read(&self, actor: &Actor, hub: &Hub) -> Result<()> {
        if self.can_read(actor, hub) {
            Ok(())
        } else {
            Err(denied(actor, hub))
        }
    }

    pub fn require_mutate(&self, actor: &Actor, hub: &Hub) -> Result<()> {
        if self.can_mutate(actor, hub) {
            Ok(())
        } else {
            Err(denied(actor, hub))
        }
    }

    /// The subset of `hubs` the actor may see.
    pub fn visible<I>(&self, actor: &Actor, hubs: I) -> Vec<Hub>
    where
        I: IntoIterator<Item = Hub>,
    {
        hubs.into_iter()
            .filter(|hub| self.can_read(actor, hub))
            .collect()
    }
}

fn denied(actor: &Actor, hub: &Hub) -> ClusterError {
    ClusterError::Permission {
        actor: actor.id.clone(),
        hub: hub.name.clone(),
    }
}
