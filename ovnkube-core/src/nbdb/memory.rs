use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use super::{
    entities::{BindingTarget, Entity, EntityKey, EntityKind},
    NorthboundTransport, TransportError,
};

/// Northbound database kept in memory, with the same containment rules as
/// the real one. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    rows: Mutex<BTreeMap<EntityKey, Entity>>,
    injected: Mutex<VecDeque<TransportError>>,
}

impl MemoryTransport {
    /// Makes the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut injected = self.injected.lock().unwrap_or_else(|e| e.into_inner());

        injected.extend(std::iter::repeat(error).take(count));
    }

    pub fn snapshot(&self) -> BTreeMap<EntityKey, Entity> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|key| key.kind() == kind)
            .count()
    }

    fn injected_error(&self) -> Result<(), TransportError> {
        match self
            .injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NorthboundTransport for MemoryTransport {
    async fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>, TransportError> {
        self.injected_error()?;

        Ok(self.get(key))
    }

    async fn apply(&self, entity: &Entity) -> Result<(), TransportError> {
        self.injected_error()?;

        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = entity.parent() {
            if !rows.contains_key(&parent) {
                return Err(TransportError::Permanent(format!(
                    "{} refers to missing {parent}",
                    entity.key()
                )));
            }
        }

        if let Entity::LoadBalancerBinding(binding) = entity {
            let target = match &binding.target {
                BindingTarget::Switch(name) => EntityKey::LogicalSwitch(name.clone()),
                BindingTarget::Router(name) => EntityKey::LogicalRouter(name.clone()),
            };

            if !rows.contains_key(&target) {
                return Err(TransportError::Permanent(format!(
                    "{} refers to missing {target}",
                    entity.key()
                )));
            }
        }

        rows.insert(entity.key(), entity.clone());

        Ok(())
    }

    async fn remove(&self, key: &EntityKey) -> Result<(), TransportError> {
        self.injected_error()?;

        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        rows.retain(|candidate, entity| candidate != key && !contained_in(entity, key));

        Ok(())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, TransportError> {
        self.injected_error()?;

        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entity| entity.kind() == kind)
            .cloned()
            .collect())
    }
}

/// Whether removing `owner` takes `entity` down with it.
fn contained_in(entity: &Entity, owner: &EntityKey) -> bool {
    if entity.parent().as_ref() == Some(owner) {
        return true;
    }

    match (entity, owner) {
        (Entity::LoadBalancerBinding(binding), EntityKey::LogicalSwitch(switch)) => {
            binding.target == BindingTarget::Switch(switch.clone())
        }
        (Entity::LoadBalancerBinding(binding), EntityKey::LogicalRouter(router)) => {
            binding.target == BindingTarget::Router(router.clone())
        }
        _ => false,
    }
}
