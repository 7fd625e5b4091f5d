//! tracing-subscriber の初期化
//!
//! レベルの優先順位:
//! 1. `--log-level`
//! 2. 環境変数 `FOREMAN_LOG`（"info", "debug" など）
//! 3. `info`
//!
//! stdout はイベントの JSON 行専用なので、ログは stderr に出します。

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "FOREMAN_LOG";

/// Install the global subscriber. Call once, at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let level = resolve_level(cli_level, std::env::var(LOG_ENV).ok().as_deref());
    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn resolve_level(cli_level: Option<LogLevel>, env: Option<&str>) -> Level {
    match cli_level {
        Some(lvl) => level_from_log_level(lvl),
        None => env.and_then(parse_level_str).unwrap_or(Level::INFO),
    }
}

fn level_from_log_level(lvl: LogLevel) -> Level {
    match lvl {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::flag_wins(Some(LogLevel::Warn), Some("trace"), Level::WARN)]
    #[case::env_used(None, Some(" Debug "), Level::DEBUG)]
    #[case::env_alias(None, Some("warning"), Level::WARN)]
    #[case::env_garbage(None, Some("loud"), Level::INFO)]
    #[case::nothing(None, None, Level::INFO)]
    fn level_priority(#[case] flag: Option<LogLevel>, #[case] env: Option<&str>, #[case] expected: Level) {
        assert_eq!(resolve_level(flag, env), expected);
    }
}
