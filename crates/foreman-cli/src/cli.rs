//! CLI 引数（clap derive）

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "foreman",
    version,
    about = "Drive a task plan through a pool of workers and resolve their blockers.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FOREMAN_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a plan until nothing can make progress, printing events as JSON lines.
    Run {
        #[arg(long, value_name = "PATH")]
        plan: PathBuf,

        /// JSON config; defaults apply when omitted.
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Answer every blocker with this text as soon as it is raised.
        #[arg(long, value_name = "TEXT")]
        auto_answer: Option<String>,
    },

    /// Check a plan for unknown keys and cycles, then print its execution order.
    Validate {
        #[arg(long, value_name = "PATH")]
        plan: PathBuf,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_auto_answer() {
        let args = CliArgs::try_parse_from([
            "foreman",
            "run",
            "--plan",
            "plan.json",
            "--auto-answer",
            "yes",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        match args.command {
            Command::Run {
                plan,
                config,
                auto_answer,
            } => {
                assert_eq!(plan, PathBuf::from("plan.json"));
                assert!(config.is_none());
                assert_eq!(auto_answer.as_deref(), Some("yes"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn validate_requires_a_plan() {
        assert!(CliArgs::try_parse_from(["foreman", "validate"]).is_err());
    }
}
