//! Plan file: the task list plus an optional scripted behavior per task.
//!
//! ```json
//! {"tasks": [
//!   {"key": "schema", "title": "Design schema", "role": "backend"},
//!   {"key": "api", "title": "Build API", "role": "backend", "depends_on": ["schema"],
//!    "fail_times": 1, "ask": {"type": "SYNC", "question": "REST or GraphQL?"}}
//! ]}
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use foreman_core::domain::Role;
use foreman_core::graph::{Plan, PlanEntry};
use foreman_core::impls::Script;

#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    pub tasks: Vec<PlanFileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanFileEntry {
    #[serde(flatten)]
    pub entry: PlanEntry,
    #[serde(flatten)]
    pub script: Script,
}

impl PlanFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading plan {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing plan {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn plan(&self) -> Plan {
        Plan {
            tasks: self.tasks.iter().map(|t| t.entry.clone()).collect(),
        }
    }

    /// Scripts keyed by task title; scripted workers look tasks up by title.
    /// When two entries share a title the first one wins.
    pub fn scripts(&self) -> HashMap<String, Script> {
        let mut scripts = HashMap::new();
        for t in &self.tasks {
            scripts
                .entry(t.entry.title.clone())
                .or_insert_with(|| t.script.clone());
        }
        scripts
    }

    pub fn roles(&self) -> Vec<Role> {
        let roles: BTreeSet<Role> = self.tasks.iter().map(|t| t.entry.role).collect();
        roles.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use foreman_core::domain::BlockerType;

    use super::*;

    const SAMPLE: &str = r#"{"tasks": [
        {"key": "schema", "title": "Design schema", "role": "backend"},
        {"key": "api", "title": "Build API", "role": "backend", "depends_on": ["schema"],
         "fail_times": 1, "ask": {"type": "SYNC", "question": "REST or GraphQL?"}},
        {"key": "ui", "title": "Build UI", "role": "frontend", "depends_on": ["api"], "work_ms": 20}
    ]}"#;

    #[test]
    fn splits_plan_and_scripts() {
        let file = PlanFile::parse(SAMPLE).unwrap();
        let plan = file.plan();
        assert_eq!(plan.tasks.len(), 3);
        assert_eq!(plan.tasks[1].depends_on, vec!["schema".to_string()]);

        let scripts = file.scripts();
        let api = &scripts["Build API"];
        assert_eq!(api.fail_times, 1);
        assert_eq!(api.ask.as_ref().map(|q| q.blocker_type), Some(BlockerType::Sync));
        assert_eq!(scripts["Build UI"].work_ms, 20);
        assert_eq!(scripts["Design schema"], Script::default());

        assert_eq!(file.roles(), vec![Role::Backend, Role::Frontend]);
    }

    #[test]
    fn rejects_missing_role() {
        let err = PlanFile::parse(r#"{"tasks": [{"key": "a", "title": "A"}]}"#).unwrap_err();
        assert!(err.to_string().contains("role"));
    }
}
