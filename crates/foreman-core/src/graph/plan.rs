//! Plan: a task list keyed by caller-chosen names, turned into graph tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GraphError, Role, Task, TaskId};
use crate::ports::IdGenerator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub key: String,
    pub title: String,
    pub role: Role,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlanEntry>,
}

impl Plan {
    /// Allocate ids and resolve key references. Keys may refer forward.
    pub fn build(
        &self,
        ids: &dyn IdGenerator,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Task>, BTreeMap<String, TaskId>), GraphError> {
        let mut keys: BTreeMap<String, TaskId> = BTreeMap::new();
        for entry in &self.tasks {
            if keys.insert(entry.key.clone(), ids.generate_task_id()).is_some() {
                return Err(GraphError::DuplicateKey(entry.key.clone()));
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for entry in &self.tasks {
            let mut deps = Vec::with_capacity(entry.depends_on.len());
            for dep in &entry.depends_on {
                let id = keys.get(dep).copied().ok_or_else(|| GraphError::UnknownKey {
                    key: entry.key.clone(),
                    missing: dep.clone(),
                })?;
                deps.push(id);
            }
            let id = keys[&entry.key];
            tasks.push(Task::new(id, entry.title.clone(), entry.role, deps, now));
        }
        Ok((tasks, keys))
    }
}
