use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `matlas plan | head`) exits cleanly
/// instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use matlas::config::loader;
use matlas::config::manifest::{load_apply_document, ApplyDocument};
use matlas::engine::Engine;
use matlas::output::formatter;
use matlas::planner::plan::Plan;
use matlas::provider::memory::MemoryControlPlane;
use matlas::reconcile::manager::Approvals;
use matlas::state::models::ProjectState;
use matlas::state::sqlite::SqliteIdempotencyStore;

/// matlas - Declarative reconciliation for managed-database projects
#[derive(Parser)]
#[command(name = "matlas", version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(short, long, default_value = "matlas.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Working directory for the control-plane snapshot and idempotency records
    #[arg(short, long, default_value = ".matlas")]
    working_dir: PathBuf,

    /// Project id, when the apply document does not name one
    #[arg(short, long)]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate an apply document without contacting the control plane
    Validate {
        /// Apply document (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show the staged plan converging the project to the document
    Plan {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Converge the project to the document
    Apply {
        #[arg(short, long)]
        file: PathBuf,

        /// Skip confirmation prompt
        #[arg(long)]
        auto_approve: bool,
    },

    /// Delete every resource the document declares, children first
    Destroy {
        #[arg(short, long)]
        file: PathBuf,

        /// Skip confirmation prompt
        #[arg(long)]
        auto_approve: bool,
    },

    /// Detect drift between the document and the live project
    Drift {
        #[arg(short, long)]
        file: PathBuf,

        /// Act on detected drift according to the reconciliation rules
        #[arg(long)]
        reconcile: bool,

        /// Approve every drift whose action is prompt
        #[arg(long)]
        approve_all: bool,

        /// Approve one drift by id or fingerprint
        #[arg(long)]
        approve: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { ref file } => cmd_validate(&cli, file).await,
        Commands::Plan { ref file } => cmd_plan(&cli, file).await,
        Commands::Apply { ref file, auto_approve } => cmd_apply(&cli, file, auto_approve).await,
        Commands::Destroy { ref file, auto_approve } => cmd_destroy(&cli, file, auto_approve).await,
        Commands::Drift {
            ref file,
            reconcile,
            approve_all,
            ref approve,
        } => cmd_drift(&cli, file, reconcile, approve_all, approve).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Engine over the control-plane snapshot in the working directory.
struct Session {
    plane: MemoryControlPlane,
    engine: Engine,
    state_path: PathBuf,
    token: CancellationToken,
}

impl Session {
    async fn open(cli: &Cli) -> Result<Self> {
        let config = loader::load_config(&cli.config)?;
        std::fs::create_dir_all(&cli.working_dir)
            .with_context(|| format!("Failed to create working directory {}", cli.working_dir.display()))?;

        let state_path = cli.working_dir.join("state.json");
        let plane = MemoryControlPlane::load(&state_path)?;

        let db_path = cli.working_dir.join("idempotency.db");
        let store = SqliteIdempotencyStore::open(&db_path.to_string_lossy())?;
        let engine = Engine::with_idempotency_store(plane.registry(), config, Arc::new(store)).await?;

        let token = CancellationToken::new();
        engine.start(&token);
        let ctrl_c = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", "Interrupted, cancelling...".yellow());
                ctrl_c.cancel();
            }
        });

        Ok(Self {
            plane,
            engine,
            state_path,
            token,
        })
    }

    async fn close(self) -> Result<()> {
        self.engine.shutdown().await;
        self.token.cancel();
        self.plane.save(&self.state_path)
    }
}

fn load_document(cli: &Cli, file: &Path) -> Result<(String, ApplyDocument)> {
    let document = load_apply_document(file)?;
    let project_id = if !document.project_id.is_empty() {
        document.project_id.clone()
    } else if let Some(project) = &cli.project {
        project.clone()
    } else {
        bail!("No project id: set projectId in {} or pass --project", file.display());
    };
    Ok((project_id, document))
}

async fn desired(session: &Session, cli: &Cli, file: &Path) -> Result<(String, ProjectState)> {
    let (project_id, document) = load_document(cli, file)?;
    let desired = session.engine.desired_state(&project_id, &document).await?;
    Ok((project_id, desired))
}

fn confirm(question: &str) -> Result<bool> {
    use std::io::Write;

    println!("\n{} Only '{}' will be accepted.", question, "yes".bold());
    print!("  Enter a value: ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == "yes")
}

async fn execute(session: &Session, plan: &mut Plan) -> Result<bool> {
    let bar = session.engine.subscribe_progress().map(formatter::spawn_progress_bar);
    let result = session.engine.apply(plan, &session.token).await?;
    if let Some(bar) = bar {
        bar.abort();
    }
    formatter::print_execution_result(plan, &result);
    Ok(result.is_success())
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_validate(cli: &Cli, file: &Path) -> Result<()> {
    let document = load_apply_document(file)?;
    let engine = Engine::new(MemoryControlPlane::new().registry(), loader::load_config(&cli.config)?);
    let report = engine.validate(&document);

    println!("  {} {} resource manifest(s)", "→".blue(), document.resources.len());
    formatter::print_validation(&report);
    if !report.is_valid() {
        bail!("{} validation error(s)", report.errors.len());
    }
    formatter::print_success("Manifests are valid.");
    Ok(())
}

async fn cmd_plan(cli: &Cli, file: &Path) -> Result<()> {
    let session = Session::open(cli).await?;
    let (project_id, desired) = desired(&session, cli, file).await?;
    let plan = session.engine.plan(&project_id, &desired).await?;
    formatter::print_plan(&plan);
    session.close().await
}

async fn cmd_apply(cli: &Cli, file: &Path, auto_approve: bool) -> Result<()> {
    let session = Session::open(cli).await?;
    let (project_id, desired) = desired(&session, cli, file).await?;

    let mut plan = session.engine.plan(&project_id, &desired).await?;
    formatter::print_plan(&plan);
    if !plan.has_changes() {
        return session.close().await;
    }

    if !auto_approve && !confirm("Do you want to perform these actions?")? {
        println!("\n{}", "Apply cancelled.".yellow());
        return session.close().await;
    }

    let success = execute(&session, &mut plan).await?;
    session.close().await?;
    if !success {
        bail!("Apply did not complete");
    }
    Ok(())
}

async fn cmd_destroy(cli: &Cli, file: &Path, auto_approve: bool) -> Result<()> {
    let session = Session::open(cli).await?;
    let (project_id, desired) = desired(&session, cli, file).await?;

    let mut plan = session.engine.destroy_plan(&project_id, &desired).await?;
    if !plan.has_changes() {
        println!("{}", "Nothing to destroy.".dimmed());
        return session.close().await;
    }
    formatter::print_plan(&plan);
    println!(
        "{} This will destroy {} resource(s).",
        "⚠".yellow().bold(),
        plan.summary().deletes.to_string().red().bold()
    );

    if !auto_approve && !confirm("Do you really want to destroy these resources?")? {
        println!("\n{}", "Destroy cancelled.".yellow());
        return session.close().await;
    }

    let success = execute(&session, &mut plan).await?;
    session.close().await?;
    if !success {
        bail!("Destroy did not complete");
    }
    Ok(())
}

async fn cmd_drift(cli: &Cli, file: &Path, reconcile: bool, approve_all: bool, approve: &[String]) -> Result<()> {
    let session = Session::open(cli).await?;
    let (project_id, desired) = desired(&session, cli, file).await?;

    let detection = session.engine.detect_drift(&project_id, &desired).await?;
    formatter::print_drift_report(&detection);

    if reconcile && detection.has_drift() {
        let approvals = if approve_all {
            Approvals::all()
        } else {
            approve.iter().fold(Approvals::none(), |a, id| a.approve(id.clone()))
        };
        let result = session.engine.reconcile(&detection, &approvals, &session.token).await?;
        formatter::print_reconciliation_result(&result);
    }

    session.close().await
}
