use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::app::operator::route_inbound;
use crate::cli::commands::{
    Cli, Commands, ConfigCommands, LogChoice, LogCommands, LogKind, RulesCommands,
};
use promptwarden::Config;
use promptwarden::autopilot::{AutonomyMode, SessionRuntime};
use promptwarden::daemon::Warden;
use promptwarden::notify::{NotificationChannel, TerminalChannel};
use promptwarden::policy::{FileRuleSource, RuleSource, SessionContext};
use promptwarden::process::{PipeSupervisor, ProcessSupervisor};
use promptwarden::prompt::SqliteLifecycleStore;
use promptwarden::status::StatusQuery;
use promptwarden::storage::open_pool;
use promptwarden::trust_log::{TrustLog, TrustLogKind, TrustRecord};

const INBOUND_QUEUE: usize = 32;
const INPUT_QUEUE: usize = 64;

struct RunArgs {
    session: Option<String>,
    tags: Vec<String>,
    mode: Option<AutonomyMode>,
    quiet: bool,
    command: Vec<String>,
}

/// Supervise one agent process until it exits or the operator hits Ctrl-C.
///
/// 1. Starts the warden (stores, startup sweep, background workers).
/// 2. Spawns the agent with piped stdio.
/// 3. Listens on stdin: `:<id> <reply>` answers a prompt, `:!<cmd>` is an
///    operator command, anything else goes to the agent.
/// 4. Runs the session and shuts everything down.
async fn run_session(config: Arc<Config>, args: RunArgs) -> Result<()> {
    let config = match args.mode {
        Some(mode) => {
            let mut overridden = (*config).clone();
            overridden.autopilot.mode = mode;
            Arc::new(overridden)
        }
        None => config,
    };
    let Some((program, program_args)) = args.command.split_first() else {
        bail!("no command to supervise");
    };

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
    let terminal = Arc::new(TerminalChannel::new(Some(input_tx)));
    let notifier: Arc<dyn NotificationChannel> = terminal.clone();
    let warden = Warden::start(Arc::clone(&config), notifier).await?;
    let services = warden.services().clone();

    let supervisor = Arc::new(
        PipeSupervisor::spawn(program, program_args, None)
            .with_context(|| format!("failed to start '{program}'"))?,
    );
    let session_id = args.session.unwrap_or_else(|| default_session_name(program));
    let context = args
        .tags
        .into_iter()
        .fold(SessionContext::new(session_id), SessionContext::with_tag);

    let process: Arc<dyn ProcessSupervisor> = supervisor.clone();
    let runtime = SessionRuntime::new(services.clone(), context, process).with_echo(!args.quiet);
    let cancel = runtime.cancel_token();

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (reply_tx, reply_rx) = mpsc::channel(INBOUND_QUEUE);
    let listener = {
        let cancel = cancel.clone();
        tokio::spawn(async move { terminal.listen(inbound_tx, cancel).await })
    };
    let router = tokio::spawn(route_inbound(
        Arc::clone(&services.autopilot),
        inbound_rx,
        reply_tx,
    ));
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping session");
                cancel.cancel();
            }
        })
    };

    eprintln!(
        "◆ promptwarden supervising '{program}' (session {}, autopilot {})",
        runtime.session_id(),
        services.autopilot.snapshot().label()
    );
    eprintln!("   Reply with :<prompt-id> <answer>; :!pause :!resume :!kill :!mode <m>");

    let summary = runtime.run(reply_rx, Some(input_rx)).await;

    cancel.cancel();
    interrupt.abort();
    router.abort();
    if let Ok(Err(e)) = listener.await {
        tracing::warn!("terminal listener stopped: {e}");
    }
    let exit_code = supervisor.try_exit_code().await.ok().flatten();
    warden.shutdown().await;

    let summary = summary?;
    eprintln!(
        "◆ session {} ended: {} prompts, {} canceled{}",
        summary.session_id,
        summary.prompts,
        summary.canceled,
        exit_code.map(|c| format!(", exit code {c}")).unwrap_or_default()
    );
    Ok(())
}

fn default_session_name(program: &str) -> String {
    let stem = std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("session");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{stem}-{}", &suffix[..6])
}

fn log_path(config: &Config, kind: TrustLogKind) -> PathBuf {
    config.storage.state_dir().join(kind.file_name())
}

fn selected_kinds(choice: LogChoice) -> Vec<TrustLogKind> {
    match choice {
        LogChoice::Governance => vec![TrustLogKind::Governance],
        LogChoice::Audit => vec![TrustLogKind::Audit],
        LogChoice::All => vec![TrustLogKind::Governance, TrustLogKind::Audit],
    }
}

fn log_kind(kind: LogKind) -> TrustLogKind {
    match kind {
        LogKind::Governance => TrustLogKind::Governance,
        LogKind::Audit => TrustLogKind::Audit,
    }
}

async fn verify_logs(config: &Config, choice: LogChoice) -> Result<()> {
    let mut broken = Vec::new();
    for kind in selected_kinds(choice) {
        let log = TrustLog::open(&log_path(config, kind), kind).await?;
        let report = log.verify().await?;
        if report.valid {
            println!("✓ {:<10} {} entries, chain intact", kind.to_string(), report.total);
        } else {
            println!("✗ {:<10} {}", kind.to_string(), report.message);
            broken.push(kind.to_string());
        }
    }
    if !broken.is_empty() {
        bail!("broken trust-log chain: {}", broken.join(", "));
    }
    Ok(())
}

async fn show_log(config: &Config, kind: TrustLogKind, limit: usize) -> Result<()> {
    let log = TrustLog::open(&log_path(config, kind), kind).await?;
    for entry in log.tail(limit).await? {
        let summary = match serde_json::from_str::<TrustRecord>(&entry.content) {
            Ok(record) => format!(
                "{} {}",
                record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                record.payload.kind_name()
            ),
            Err(_) => "(unparseable content)".into(),
        };
        println!(
            "{:>6}  {}  {summary}  {}",
            entry.step,
            entry.hash.get(..12).unwrap_or(&entry.hash),
            entry.content
        );
    }
    Ok(())
}

async fn export_log(config: &Config, kind: TrustLogKind) -> Result<()> {
    let log = TrustLog::open(&log_path(config, kind), kind).await?;
    for entry in log.entries().await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn check_rules(config: &Config, path: Option<PathBuf>) -> Result<()> {
    let path = path.unwrap_or_else(|| config.policy.rules_path());
    let source = FileRuleSource::new(&path, config.policy.max_pattern_size);
    let rules = source.load_rules()?;
    println!("◆ {} ({} rules, fingerprint {})", path.display(), rules.len(), rules.fingerprint());
    if rules.is_empty() {
        println!("   no rules: every prompt escalates to a human");
    }
    for rule in rules.rules() {
        let extends = rule
            .extends
            .as_deref()
            .map(|parent| format!(" extends {parent}"))
            .unwrap_or_default();
        let types = if rule.prompt_types.is_empty() {
            "any".to_string()
        } else {
            rule.prompt_types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        println!(
            "  {:>3}. {:<24} {:<13} types={types} patterns={}/{}{extends}",
            rule.position,
            rule.id,
            rule.action.to_string(),
            rule.any_of.len(),
            rule.none_of.len()
        );
    }
    Ok(())
}

async fn show_status(config: &Config, session: Option<String>, limit: usize) -> Result<()> {
    let pool = open_pool(&config.storage.decisions_db()).await?;
    let store = SqliteLifecycleStore::new(pool).await?;
    let report = StatusQuery::new(&store)
        .session(session)
        .limit(limit)
        .run()
        .await?;
    print!("{}", report.render());
    Ok(())
}

pub async fn dispatch(cli: Cli, config: Arc<Config>) -> Result<()> {
    match cli.command {
        Commands::Run {
            session,
            tags,
            mode,
            quiet,
            command,
        } => {
            run_session(
                config,
                RunArgs {
                    session,
                    tags,
                    mode,
                    quiet,
                    command,
                },
            )
            .await
        }
        Commands::Verify { log } => verify_logs(&config, log).await,
        Commands::Log { log_command } => match log_command {
            LogCommands::Show { log, limit } => show_log(&config, log_kind(log), limit).await,
            LogCommands::Export { log } => export_log(&config, log_kind(log)).await,
        },
        Commands::Rules { rules_command } => match rules_command {
            RulesCommands::Check { path } => check_rules(&config, path),
        },
        Commands::Status { session, limit } => show_status(&config, session, limit).await,
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                println!("# {}", config.config_path.display());
                print!("{}", toml::to_string_pretty(&*config)?);
                Ok(())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_name_uses_program_stem() {
        let name = default_session_name("/usr/local/bin/claude");
        assert!(name.starts_with("claude-"));
        assert_eq!(name.len(), "claude-".len() + 6);
    }

    #[test]
    fn all_selects_both_logs() {
        assert_eq!(selected_kinds(LogChoice::All).len(), 2);
        assert_eq!(log_kind(LogKind::Audit), TrustLogKind::Audit);
    }

    #[test]
    fn check_rules_accepts_a_missing_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::default();
        check_rules(&config, Some(tmp.path().join("absent.toml"))).unwrap();
    }
}
