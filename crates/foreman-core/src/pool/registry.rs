use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{PoolError, Role};
use crate::ports::WorkerFactory;

/// Registry of worker factories (role -> factory).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used by the pool afterwards (immutable, shared behind Arc).
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<Role, Arc<dyn WorkerFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a role. A second factory for the same role is an error.
    pub fn register(&mut self, role: Role, factory: Arc<dyn WorkerFactory>) -> Result<(), PoolError> {
        if self.factories.contains_key(&role) {
            return Err(PoolError::DuplicateRole(role));
        }
        self.factories.insert(role, factory);
        Ok(())
    }

    pub fn get(&self, role: Role) -> Option<&Arc<dyn WorkerFactory>> {
        self.factories.get(&role)
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self.factories.keys().copied().collect();
        roles.sort();
        roles
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
