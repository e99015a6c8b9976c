mod config;
mod relaunch;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clusterops_core::{DnsConfig, OperationKind, Phase, Plan};
use events::{Event, EventBus};
use orchestrator::agent::AgentCoordinator;
use orchestrator::kube::HttpClusterClientFactory;
use orchestrator::{install_resolver, Engine, InstallConfig, OrchestratorError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use config::Settings;
use relaunch::{update_command_with_flags, Flag};

#[derive(Parser)]
#[command(name = "clusterops")]
#[command(about = "Run and recover cluster lifecycle operations", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.clusterops/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage operation plans
    #[command(subcommand)]
    Plan(PlanCommand),
}

#[derive(Subcommand)]
enum PlanCommand {
    /// Store a new plan read from a JSON or YAML file
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    List,
    Display(OperationArgs),
    Execute(RunArgs),
    Resume(RunArgs),
    Rollback {
        #[command(flatten)]
        run: RunArgs,

        /// Only unwind phases finished at or after this phase
        #[arg(long)]
        phase: Option<String>,
    },
    Complete(OperationArgs),
}

#[derive(Args)]
struct OperationArgs {
    #[arg(long)]
    operation_id: Uuid,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    operation: OperationArgs,

    /// Print a service definition running this command instead of running it
    #[arg(long)]
    detach: bool,

    #[arg(long, hide = true)]
    from_service: bool,
}

/// Plan file accepted by `plan create`.
#[derive(Deserialize)]
struct PlanDefinition {
    #[serde(default)]
    operation_kind: OperationKind,
    cluster_name: String,
    #[serde(default)]
    dns_config: Option<DnsConfig>,
    phases: Vec<Phase>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(exit_code(&err));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Commands::Plan(command) = cli.command;

    if let Some(run) = command.run_args() {
        if run.detach && !run.from_service {
            return detach();
        }
    }

    let (settings, config_path) = Settings::load(cli.config.as_deref())?;
    let (engine, bus) = open_engine(&settings, &config_path).await?;

    match command {
        PlanCommand::Create { file } => create(&engine, &file).await,
        PlanCommand::List => list(&engine).await,
        PlanCommand::Display(args) => display(&engine, args.operation_id).await,
        PlanCommand::Execute(run) => {
            let cancel = cancel_on_ctrl_c();
            spawn_progress(&bus, run.operation.operation_id);
            engine.execute(run.operation.operation_id, &cancel).await?;
            Ok(())
        }
        PlanCommand::Resume(run) => {
            let cancel = cancel_on_ctrl_c();
            spawn_progress(&bus, run.operation.operation_id);
            engine.resume(run.operation.operation_id, &cancel).await?;
            Ok(())
        }
        PlanCommand::Rollback { run, phase } => {
            let cancel = cancel_on_ctrl_c();
            spawn_progress(&bus, run.operation.operation_id);
            engine
                .rollback(run.operation.operation_id, phase.as_deref(), &cancel)
                .await?;
            Ok(())
        }
        PlanCommand::Complete(args) => {
            engine.complete(args.operation_id).await?;
            println!("Operation {} completed", args.operation_id);
            Ok(())
        }
    }
}

impl PlanCommand {
    fn run_args(&self) -> Option<&RunArgs> {
        match self {
            Self::Execute(run) | Self::Resume(run) | Self::Rollback { run, .. } => Some(run),
            _ => None,
        }
    }
}

async fn open_engine(settings: &Settings, config_path: &Path) -> Result<(Engine, EventBus)> {
    let database_url = settings.database_url(config_path);
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    tracing::debug!(database = %database_url, "Opening plan database");
    let pool = db::open(&database_url, &settings.pool_config())
        .await
        .context("Failed to open the plan database")?;

    let bus = EventBus::new();

    let coordinator = AgentCoordinator::new(settings.agent_config())?.with_event_bus(bus.clone());
    let (kube, token) = settings.kube_config();
    let resolver = install_resolver(InstallConfig::new(
        Arc::new(coordinator),
        Arc::new(HttpClusterClientFactory::new(kube, token)),
    ));

    let engine = Engine::new(Arc::new(db::PlanRepository::new(pool)), resolver)
        .with_config(settings.engine_config())
        .with_event_bus(bus.clone());
    Ok((engine, bus))
}

/// Prints the progress of one operation as the engine reports it.
fn spawn_progress(bus: &EventBus, operation_id: Uuid) {
    let mut events = bus.subscribe_operation(operation_id);
    tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            match envelope.event {
                Event::PhaseStateChanged {
                    phase_id, to_state, ..
                } => println!("  {:<40} {}", phase_id, to_state),
                Event::PhaseRetrying {
                    phase_id,
                    attempt,
                    error,
                    ..
                } => println!("  {:<40} retrying (attempt {}): {}", phase_id, attempt, error),
                Event::PeerDisconnected { peer, .. } => println!("  lost connection to {}", peer),
                _ => {}
            }
        }
    });
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling operation");
            token.cancel();
        }
    });
    cancel
}

async fn create(engine: &Engine, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let definition: PlanDefinition = match file.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };

    let mut plan =
        Plan::new(definition.operation_kind, definition.cluster_name).with_phases(definition.phases);
    if let Some(dns) = definition.dns_config {
        plan = plan.with_dns_config(dns);
    }
    let plan = engine.create(plan).await?;

    println!("Created operation {}", plan.operation_id);
    Ok(())
}

async fn list(engine: &Engine) -> Result<()> {
    let plans = engine.plans().await?;
    if plans.is_empty() {
        println!("No operations yet.");
        return Ok(());
    }

    for plan in &plans {
        let status = if plan.is_completed() {
            "completed"
        } else {
            "open"
        };
        println!(
            "{}  {:<8} {:<10} {:<24} {}",
            plan.operation_id,
            plan.operation_kind.as_str(),
            status,
            plan.cluster_name,
            plan.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn display(engine: &Engine, operation_id: Uuid) -> Result<()> {
    let plan = engine.plan(operation_id).await?;
    println!();
    println!(
        "Operation {} ({}) on {}",
        plan.operation_id,
        plan.operation_kind.as_str(),
        plan.cluster_name
    );
    println!();
    print_phases(&plan.phases, 0);
    println!();
    Ok(())
}

fn print_phases(phases: &[Phase], depth: usize) {
    for phase in phases {
        let indent = "  ".repeat(depth + 1);
        println!(
            "{}{:<width$} {:<12} {}",
            indent,
            phase.id,
            phase.state.as_str(),
            phase.description,
            width = 40usize.saturating_sub(indent.len()),
        );
        if let Some(error) = &phase.error {
            println!("{}  error ({}): {}", indent, error.kind, error.message);
        }
        print_phases(&phase.phases, depth + 1);
    }
}

/// Prints a systemd `ExecStart=` line re-running this command as a service.
fn detach() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let line = update_command_with_flags(
        &Cli::command(),
        &args,
        &[Flag::new("from-service", "true")],
    )?;
    let binary = std::env::current_exe().context("Failed to locate the current executable")?;

    println!("ExecStart={} {}", binary.display(), line.join(" "));
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<OrchestratorError>()
        .map_or(1, OrchestratorError::exit_code)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clusterops=info,orchestrator=info,db=info".into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_detach_line_adds_from_service() {
        let id = Uuid::new_v4().to_string();
        let args: Vec<String> = ["plan", "execute", "--operation-id", id.as_str(), "--detach"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let line = update_command_with_flags(
            &Cli::command(),
            &args,
            &[Flag::new("from-service", "true")],
        )
        .unwrap();

        assert_eq!(&line[..2], ["plan", "execute"]);
        assert!(line.contains(&format!("{:?}", id)));
        assert!(line.contains(&"--detach".to_string()));
        assert_eq!(line.last().unwrap(), "--from-service");
    }

    #[test]
    fn test_plan_definition_yaml() {
        let definition: PlanDefinition = serde_yaml::from_str(
            r#"
cluster_name: example.com
phases:
  - id: /masters
    description: Install masters
    phases:
      - id: /masters/node-1
        description: Install node-1
        data:
          server:
            hostname: node-1
            advertise_ip: 10.0.0.5
  - id: /openebs
    description: Configure OpenEBS
    requires: [/masters]
"#,
        )
        .unwrap();

        assert_eq!(definition.operation_kind, OperationKind::Install);
        let plan = Plan::new(definition.operation_kind, definition.cluster_name)
            .with_phases(definition.phases);
        plan.validate().unwrap();
        assert_eq!(plan.leaves().len(), 2);
    }

    #[test]
    fn test_exit_code_from_error_chain() {
        let err = anyhow::Error::new(OrchestratorError::ExitCode(
            orchestrator::ExitCodeError::new(3),
        ));
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("plain failure")), 1);
    }
}
