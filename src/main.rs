//! CLI driver for saferun.
//!
//! A thin layer over the core: parses arguments, initializes tracing (to
//! stderr or a log file, never stdout, which belongs to dry-run output),
//! and maps outcomes to exit codes. Exit 0 on success, 1 on any runtime
//! failure, 2 on usage errors (clap), 3 is reserved for the privilege
//! restore abort inside the core.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use saferun::audit::Audit;
use saferun::config::{self, plan};
use saferun::executor::dryrun::{self, DetailLevel, DryRunFormat};
use saferun::executor::{ExecutionMode, Executor};
use saferun::privilege::PrivilegeManager;
use saferun::{DigestStore, environment};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "saferun", version, about = "Policy-driven batch command runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute (or analyze) the pipelines in a configuration file.
    Run(RunArgs),
    /// Compute and store the digest of a file.
    Record(RecordArgs),
    /// Recompute digests and compare against the store.
    Verify(VerifyArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the TOML configuration.
    #[arg(long)]
    config: PathBuf,

    /// Analyze without executing anything.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, value_enum, default_value = "summary")]
    dry_run_detail: DetailLevel,

    #[arg(long, value_enum, default_value = "text")]
    dry_run_format: DryRunFormat,

    /// Show sensitive environment values instead of redacting them.
    #[arg(long)]
    show_sensitive: bool,

    /// Load, expand and validate the configuration, then stop.
    #[arg(long)]
    validate: bool,

    /// Log filter (overrides RUST_LOG), e.g. "debug" or "saferun=trace".
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs to a file in this directory instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RecordArgs {
    /// File to digest.
    #[arg(long)]
    file: PathBuf,

    /// Overwrite an existing entry.
    #[arg(long)]
    force: bool,

    /// Alternate digest store root. Test builds only.
    #[cfg(feature = "testing")]
    #[arg(long)]
    hash_dir: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    /// Files to verify.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Alternate digest store root. Test builds only.
    #[cfg(feature = "testing")]
    #[arg(short = 'd', long)]
    hash_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Record(args) => cmd_record(&args),
        Commands::Verify(args) => cmd_verify(&args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("saferun: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let run_id = uuid::Uuid::now_v7().to_string();
    init_logging(args.log_level.as_deref(), args.log_dir.as_deref(), &run_id)?;
    tracing::info!(run_id = %run_id, "saferun v{}", env!("CARGO_PKG_VERSION"));

    let store = DigestStore::new();
    let config = config::load_verified(&args.config, &store)?;
    let system = environment::system_snapshot();
    let plan = plan::materialize(&config, &system)?;

    if args.validate {
        let commands: usize = plan.groups.iter().map(|g| g.commands.len()).sum();
        println!(
            "configuration OK: {} group(s), {commands} command(s)",
            plan.groups.len()
        );
        return Ok(ExitCode::SUCCESS);
    }

    let privileges = PrivilegeManager::new();
    let audit = Audit::new(&run_id);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, terminating in-flight command");
            let _ = shutdown_tx.send(true);
        }
    });

    let mode = if args.dry_run {
        ExecutionMode::DryRun {
            detail: args.dry_run_detail,
            show_sensitive: args.show_sensitive,
        }
    } else {
        ExecutionMode::Normal
    };

    let executor = Executor::new(&plan, &store, &privileges, audit, shutdown_rx);
    let outcome = executor.execute(mode).await?;

    if let Some(analysis) = &outcome.analysis {
        match args.dry_run_format {
            DryRunFormat::Json => println!("{}", serde_json::to_string_pretty(analysis)?),
            DryRunFormat::Text => print!("{}", dryrun::render_text(analysis)),
        }
    } else {
        for group in &outcome.run.groups {
            for cmd in &group.commands {
                match (&cmd.error, cmd.exit_code) {
                    (Some(error), _) => {
                        eprintln!("{}: {}: {error}", cmd.resource, cmd.reason);
                    }
                    (None, Some(code)) => {
                        tracing::info!(resource = %cmd.resource, exit_code = code, reason = %cmd.reason, "command finished");
                    }
                    (None, None) => {}
                }
            }
        }
    }

    Ok(if outcome.run.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn cmd_record(args: &RecordArgs) -> Result<ExitCode> {
    let store = open_store_record(args);
    let entry = store.record(&args.file, args.force)?;
    println!("recorded {} -> {}", args.file.display(), entry.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_verify(args: &VerifyArgs) -> Result<ExitCode> {
    let store = open_store_verify(args);
    let mut failures = 0usize;
    for file in &args.files {
        match store.verify(file) {
            Ok(()) => println!("OK {}", file.display()),
            Err(e) => {
                failures += 1;
                eprintln!("FAILED {}: {e}", file.display());
            }
        }
    }
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn open_store_record(args: &RecordArgs) -> DigestStore {
    #[cfg(feature = "testing")]
    if let Some(dir) = &args.hash_dir {
        return DigestStore::with_root(dir);
    }
    let _ = args;
    DigestStore::new()
}

fn open_store_verify(args: &VerifyArgs) -> DigestStore {
    #[cfg(feature = "testing")]
    if let Some(dir) = &args.hash_dir {
        return DigestStore::with_root(dir);
    }
    let _ = args;
    DigestStore::new()
}

/// Initialize tracing exactly once. Logs go to stderr (or a per-run file
/// under `--log-dir`); stdout is reserved for dry-run artifacts.
fn init_logging(level: Option<&str>, log_dir: Option<&Path>, run_id: &str) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = std::fs::File::create(dir.join(format!("saferun-{run_id}.log")))?;
            let file = std::sync::Arc::new(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(move || SharedFile(file.clone()))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(use_color())
                .init();
        }
    }
    Ok(())
}

/// A cloneable writer over one shared log file.
struct SharedFile(std::sync::Arc<std::fs::File>);

impl std::io::Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

/// Terminal color decision: CLICOLOR_FORCE wins, then NO_COLOR, then
/// CLICOLOR=0, then whether stderr is a terminal.
fn use_color() -> bool {
    use std::io::IsTerminal;

    if let Ok(force) = std::env::var("CLICOLOR_FORCE") {
        if force != "0" {
            return true;
        }
    }
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if let Ok(v) = std::env::var("CLICOLOR") {
        if v == "0" {
            return false;
        }
    }
    std::io::stderr().is_terminal()
}
