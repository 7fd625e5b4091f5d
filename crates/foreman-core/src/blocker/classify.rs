//! Failure / question classification by phrase patterns.
//!
//! - Human: only a person can unblock it (ambiguous requirements, credentials,
//!   external quota).
//! - Tactical: a routine choice a supervisor could answer on its own
//!   (package manager, overwrite an existing file, ...).
//! - Technical: a coding or execution error the worker should fix itself.
//!
//! Human patterns are checked first, so a text matching both lists is Human.

use serde::{Deserialize, Serialize};

/// Self-correction attempts after which a technical failure escalates anyway.
pub const MAX_SELF_CORRECTIONS: u32 = 2;

const HUMAN_PATTERNS: &[&str] = &[
    "unclear",
    "ambiguous",
    "which approach",
    "should i use",
    "please clarify",
    "need clarification",
    "multiple options",
    "design decision",
    "permission denied",
    "access denied",
    "authentication required",
    "api key",
    "credentials",
    "secret",
    "token required",
    "service unavailable",
    "rate limited",
    "quota exceeded",
];

const TACTICAL_PATTERNS: &[&str] = &[
    "virtual environment",
    "venv",
    "virtualenv",
    "pip install",
    "npm install",
    "uv sync",
    "break-system-packages",
    "pipx",
    "package manager",
    "dependency installation",
    "externally-managed",
    "externally managed",
    "no module named",
    "cannot be directly executed",
    "modulenotfounderror",
    "importerror",
    "pytest.ini",
    "pyproject.toml",
    "fixture scope",
    "loop scope",
    "configuration file",
    "would you like me to",
    "would you prefer",
    "should i create",
    "which version",
    "overwrite",
    "existing file",
];

const TECHNICAL_PATTERNS: &[&str] = &[
    "file not found",
    "no such file",
    "directory not found",
    "path does not exist",
    "module not found",
    "import error",
    "cannot find module",
    "syntax error",
    "syntaxerror",
    "indentation error",
    "name error",
    "type error",
    "typeerror",
    "attribute error",
    "undefined",
    "not defined",
    "command not found",
    "exit code",
    "non-zero exit",
    "missing",
    "expected",
    "invalid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Tactical,
    Human,
    Technical,
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Classify a failure reason or blocker question. Unrecognized text is Technical.
pub fn classify_failure(text: &str) -> FailureClass {
    let lower = text.to_lowercase();
    if matches_any(&lower, HUMAN_PATTERNS) {
        FailureClass::Human
    } else if matches_any(&lower, TACTICAL_PATTERNS) {
        FailureClass::Tactical
    } else {
        // technical patterns and the default agree
        FailureClass::Technical
    }
}

/// True when the text matched a technical pattern explicitly (not by default).
pub fn is_known_technical(text: &str) -> bool {
    matches_any(&text.to_lowercase(), TECHNICAL_PATTERNS)
}

/// Whether a question reads like a routine choice rather than a real decision.
pub fn is_tactical(question: &str) -> bool {
    classify_failure(question) == FailureClass::Tactical
}

/// Human failures always escalate; technical ones only after the worker has
/// tried to fix them itself; tactical ones never.
pub fn should_escalate(class: FailureClass, self_corrections: u32) -> bool {
    match class {
        FailureClass::Human => true,
        FailureClass::Technical => self_corrections >= MAX_SELF_CORRECTIONS,
        FailureClass::Tactical => false,
    }
}
