use clap::{Parser, Subcommand, ValueEnum};
use promptwarden::autopilot::AutonomyMode;
use std::path::PathBuf;

/// `promptwarden` - policy-gated prompt interception for supervised CLI agents.
#[derive(Parser, Debug)]
#[command(name = "promptwarden")]
#[command(version)]
#[command(about = "Answer or escalate the prompts a CLI agent stalls on.", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise an agent process under the autopilot
    Run {
        /// Session name (default: program name plus a short random suffix)
        #[arg(long)]
        session: Option<String>,

        /// Session tag that rules can match on (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Autonomy mode for this run (off, assist, full)
        #[arg(long)]
        mode: Option<AutonomyMode>,

        /// Do not copy the agent's output to this terminal
        #[arg(long)]
        quiet: bool,

        /// Command to supervise, after `--`
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Verify trust-log hash chains (non-zero exit on a broken chain)
    Verify {
        #[arg(long, value_enum, default_value_t = LogChoice::All)]
        log: LogChoice,
    },

    /// Inspect trust logs
    Log {
        #[command(subcommand)]
        log_command: LogCommands,
    },

    /// Validate policy rules
    Rules {
        #[command(subcommand)]
        rules_command: RulesCommands,
    },

    /// Show prompt and session status
    Status {
        /// Only this session
        #[arg(long)]
        session: Option<String>,

        /// Maximum prompts listed
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// Print the newest entries
    Show {
        #[arg(long, value_enum)]
        log: LogKind,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Write every entry as JSON lines to stdout
    Export {
        #[arg(long, value_enum)]
        log: LogKind,
    },
}

#[derive(Subcommand, Debug)]
pub enum RulesCommands {
    /// Load a rule file and print rules in evaluation order
    Check {
        /// Rule file (default: policy.rules_path)
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    Governance,
    Audit,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogChoice {
    Governance,
    Audit,
    All,
}
