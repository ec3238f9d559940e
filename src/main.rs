//! mend - Iterative healing for Python repositories

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use mend::diagnostics::counts_by_category;
use mend::publish::branch_name;
use mend::workspace::{GitCloneWorkspaceManager, LocalCopyWorkspaceManager};
use mend::{
    CancelFlag, Collaborators, Delivery, Diagnostic, DiagnosticRunner, Event, EventBus, EventKind,
    HealConfig, HealError, Orchestrator, RunRequest, RunStatus, RunSummary, Workspace,
    WorkspaceManager,
};

#[derive(Parser)]
#[command(name = "mend")]
#[command(version)]
#[command(about = "Iteratively diagnose, repair and publish fixes for Python repositories", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (JSON, or TOML by extension)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Heal a repository until its checks pass or a limit is reached
    Run {
        /// Repository URL, or a local directory with --copy
        repo: String,

        /// Team label used in the fix branch name
        #[arg(long)]
        team: String,

        /// Leader label used in the fix branch name
        #[arg(long)]
        leader: String,

        /// Maximum iterations (overrides settings)
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Time budget in seconds (overrides settings)
        #[arg(long, value_name = "SECS")]
        time_budget: Option<u64>,

        /// Copy a local directory instead of cloning
        #[arg(long)]
        copy: bool,

        /// Emit events and the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose a local project without repairing it
    Scan {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Emit diagnostics as JSON
        #[arg(long)]
        json: bool,

        /// Check command (overrides settings)
        #[arg(long, value_name = "CMD")]
        check_command: Option<String>,
    },

    /// Print the fix branch name for a team and leader
    BranchName {
        #[arg(long)]
        team: String,

        #[arg(long)]
        leader: String,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration and where it came from
    Show,
    /// Validate the effective configuration
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            e.downcast_ref::<HealError>().map_or(2, HealError::exit_code)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "mend=debug,info" } else { "mend=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let explicit = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            repo,
            team,
            leader,
            max_iterations,
            time_budget,
            copy,
            json,
        } => {
            let mut request = RunRequest::new(repo, team, leader);
            if let Some(max) = max_iterations {
                request = request.with_max_iterations(max);
            }
            if let Some(secs) = time_budget {
                request = request.with_time_budget(Duration::from_secs(secs));
            }
            run_command(explicit, request, copy, json).await
        }
        Commands::Scan {
            path,
            json,
            check_command,
        } => scan_command(explicit, &path, check_command, json),
        Commands::BranchName { team, leader } => {
            let (config, _) = HealConfig::load(explicit, Path::new("."))?;
            println!("{}", branch_name(&team, &leader, &config.publish.branch_suffix)?);
            Ok(0)
        }
        Commands::Config { action } => config_command(explicit, &action),
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_command(
    explicit: Option<&Path>,
    request: RunRequest,
    copy: bool,
    json: bool,
) -> anyhow::Result<i32> {
    let (config, origin) = HealConfig::load(explicit, Path::new("."))?;
    debug!(%origin, "Configuration loaded");
    config.validate()?;

    let base = config.run.workspace_dir();
    let workspaces: Arc<dyn WorkspaceManager> = if copy {
        Arc::new(LocalCopyWorkspaceManager::new(base))
    } else {
        Arc::new(GitCloneWorkspaceManager::new(base))
    };
    let collaborators = Collaborators::from_config(&config, workspaces);
    let orchestrator = Orchestrator::new(config, collaborators);

    let run = orchestrator.prepare(&request)?;
    if !json {
        println!(
            "{} {} on branch {}",
            "Healing".cyan().bold(),
            run.repo_ref,
            run.branch.bold()
        );
    }

    let bus = Arc::new(EventBus::new(run.id.clone()));
    let mut stream = bus.subscribe();
    let shared = Arc::new(RwLock::new(run));
    let cancel = CancelFlag::new();

    let printer = tokio::spawn(async move {
        while let Some(delivery) = stream.next().await {
            print_delivery(&delivery, json);
        }
    });
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current step");
                cancel.cancel();
            }
        })
    };

    orchestrator.execute(Arc::clone(&shared), bus, cancel).await;
    interrupt.abort();
    if let Err(e) = printer.await {
        warn!("Event printer stopped: {}", e);
    }

    let summary = shared
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .summary();
    print_summary(&summary, json)?;
    Ok(summary.status.exit_code())
}

fn print_delivery(delivery: &Delivery, json: bool) {
    match delivery {
        Delivery::Event(event) if json => match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Could not serialize event {}: {}", event.seq, e),
        },
        Delivery::Event(event) => print_event(event),
        Delivery::Missed(n) => warn!("Missed {} events", n),
    }
}

fn print_event(event: &Event) {
    let label = match event.kind {
        EventKind::Terminal => event.kind.as_str().bold(),
        EventKind::GenerativeExhausted => event.kind.as_str().yellow(),
        EventKind::FixesApplied | EventKind::CommitOutcome => event.kind.as_str().green(),
        _ => event.kind.as_str().cyan(),
    };
    if event.kind == EventKind::Terminal {
        println!("{:>4} {}", event.seq, label);
    } else {
        println!("{:>4} {} {}", event.seq, label, event.payload.to_string().dimmed());
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    let status = match summary.status {
        RunStatus::Passed => summary.status.as_str().green().bold(),
        RunStatus::Failed => summary.status.as_str().yellow().bold(),
        _ => summary.status.as_str().red().bold(),
    };
    println!();
    println!("{} {}", "Run".bold(), summary.run_id);
    println!("  Status:      {status}");
    if let Some(reason) = summary.reason {
        println!("  Reason:      {reason:?}");
    }
    println!("  Branch:      {}", summary.branch);
    println!("  Iterations:  {}", summary.iterations);
    println!("  Failures:    {}", summary.total_failures);
    println!("  Fixes:       {}", summary.total_fixes_applied);
    println!("  Commits:     {}", summary.total_commits);
    println!("  Time taken:  {:.1}s", summary.time_taken_secs);
    if let Some(score) = summary.score {
        println!(
            "  Score:       {} (base {} + speed {} - penalty {})",
            score.total.to_string().bold(),
            score.base,
            score.speed_bonus,
            score.efficiency_penalty
        );
    }
    if let Some(error) = &summary.error {
        println!("  Error:       {}", error.red());
    }
    Ok(())
}

// ============================================================================
// scan
// ============================================================================

fn scan_command(
    explicit: Option<&Path>,
    path: &Path,
    check_command: Option<String>,
    json: bool,
) -> anyhow::Result<i32> {
    let (mut config, _) = HealConfig::load(explicit, path)?;
    if let Some(command) = check_command {
        config.diagnostics.check_command = command;
    }
    config.validate()?;

    let workspace = Workspace::open(path)?;
    let runner = DiagnosticRunner::from_config(&config.diagnostics);
    let diagnostics = runner
        .scan(&workspace)
        .with_context(|| format!("scan of {} failed", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else {
        print_diagnostics(&diagnostics);
    }
    Ok(i32::from(!diagnostics.is_empty()))
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        println!("{} No failures found", "✓".green());
        return;
    }
    for d in diagnostics {
        println!(
            "{:<12} {}  {}",
            d.category.as_str().yellow().bold(),
            d.location(),
            d.message
        );
    }
    let counts = counts_by_category(diagnostics)
        .into_iter()
        .map(|(category, n)| format!("{category}: {n}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!();
    println!("{} {} failures ({})", "✗".red(), diagnostics.len(), counts);
}

// ============================================================================
// config
// ============================================================================

fn config_command(explicit: Option<&Path>, action: &ConfigAction) -> anyhow::Result<i32> {
    let (config, origin) = HealConfig::load(explicit, Path::new("."))?;
    match action {
        ConfigAction::Show => {
            println!("{} {}", "Source:".bold(), origin);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Validate => {
            let problems = config.problems();
            if problems.is_empty() {
                println!("{} Configuration is valid ({})", "✓".green(), origin);
            } else {
                for (field, reason) in &problems {
                    println!("{} {}: {}", "✗".red(), field, reason);
                }
                config.validate()?;
            }
        }
    }
    Ok(0)
}
