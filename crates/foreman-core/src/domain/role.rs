//! Worker specialization tags.
//!
//! The set of roles is closed: role-specific behavior lives behind the
//! `Worker` capability trait, never behind runtime type checks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Backend,
    Frontend,
    Test,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Backend, Role::Frontend, Role::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Backend => "backend",
            Role::Frontend => "frontend",
            Role::Test => "test",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?} (expected backend, frontend or test)")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    /// Accepts the short tag as well as the long agent-type names
    /// (`backend-worker`, `frontend-specialist`, `test-engineer`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backend" | "backend-worker" => Ok(Role::Backend),
            "frontend" | "frontend-specialist" => Ok(Role::Frontend),
            "test" | "test-engineer" => Ok(Role::Test),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::short("backend", Role::Backend)]
    #[case::agent_type("frontend-specialist", Role::Frontend)]
    #[case::mixed_case("Test-Engineer", Role::Test)]
    #[case::padded(" backend-worker ", Role::Backend)]
    fn parses_aliases(#[case] input: &str, #[case] expected: Role) {
        assert_eq!(input.parse::<Role>().unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!("devops".parse::<Role>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Frontend).unwrap(), "\"frontend\"");
    }
}
