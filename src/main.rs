//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use converge::config::{find_project_file, ConfigParser, ConfigValidator, ProjectConfig};
use converge::error::{ConvergeError, Result};
use converge::graph::Address;
use converge::planner::{cancellation, CancelSignal, Plan};
use converge::provider::{ProviderContext, SimulatedProvider};
use converge::reconciler::{
    Reconciler, RunReport, EXIT_HARD_FAILURE, EXIT_PARTIAL_FAILURE, EXIT_SUCCESS,
};
use converge::state::{generate_holder_id, LocalStateStore, StateStore};

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Provider setting holding an artificial per-call latency in milliseconds.
const LATENCY_SETTING: &str = "latency_ms";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(EXIT_HARD_FAILURE);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            debug!("Command failed: {e:?}");
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_HARD_FAILURE)
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the verbosity flag when set.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point, returning the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| EXIT_SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, yes, false, &formatter).await,
        Commands::Destroy { yes } => cmd_apply(config, yes, true, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initializes a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Project file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".converge/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.yaml with your resources");
    eprintln!("  2. Run 'converge validate' to check the project");
    eprintln!("  3. Run 'converge plan' to preview changes");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(())
}

/// Validates the project file.
fn cmd_validate(config: Option<&Path>, warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let project = load_project(config)?;
    let result = ConfigValidator::new().check(&project);

    eprint!("{}", formatter.format_validation(&result, warnings));

    if result.is_valid() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_HARD_FAILURE)
    }
}

/// Shows the resource graph.
fn cmd_graph(config: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let project = load_valid_project(config)?;
    let store = LocalStateStore::with_state_path(&project.settings.state.path);
    let context = ProviderContext::from_env();
    let provider = build_provider(&context);
    let reconciler = Reconciler::new(&project, &store, provider, context);

    let (graph, order) = reconciler.graph()?;
    emit(formatter, &formatter.format_graph(&graph, &order));
    Ok(EXIT_SUCCESS)
}

/// Computes and displays the plan.
async fn cmd_plan(config: Option<&Path>, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let project = load_valid_project(config)?;
    let store = LocalStateStore::with_state_path(&project.settings.state.path);
    let context = ProviderContext::from_env();
    let provider = build_provider(&context);
    let reconciler = Reconciler::new(&project, &store, provider, context);

    let plan = reconciler.plan().await?;
    emit(formatter, &formatter.format_plan(&plan, detailed));
    Ok(EXIT_SUCCESS)
}

/// Plans and applies changes, or destroys everything recorded in state.
///
/// After confirmation the run executes only if it still produces the plan
/// that was shown.
async fn cmd_apply(
    config: Option<&Path>,
    yes: bool,
    destroy: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let project = load_valid_project(config)?;
    let store = LocalStateStore::with_state_path(&project.settings.state.path);
    let context = ProviderContext::from_env();
    let provider = build_provider(&context);
    let reconciler = Reconciler::new(&project, &store, provider, context);

    let confirmed = if yes {
        None
    } else {
        let preview = if destroy {
            reconciler.plan_destroy().await?
        } else {
            reconciler.plan().await?
        };
        eprint!("{}", OutputFormatter::new(OutputFormat::Text).format_plan(&preview, false));
        if !preview.has_changes() {
            return Ok(EXIT_SUCCESS);
        }
        if !confirm(&preview, destroy)? {
            eprintln!("Cancelled.");
            return Ok(EXIT_SUCCESS);
        }
        Some(preview)
    };

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling pending actions");
            handle.cancel();
        }
    });

    match run_reconciler(&reconciler, destroy, confirmed.as_ref(), signal).await {
        Ok(report) => {
            emit(formatter, &formatter.format_report(&report));
            Ok(report.exit_code())
        }
        Err(ConvergeError::ApplyInterrupted { report, source }) => {
            emit(formatter, &formatter.format_apply(&report));
            eprintln!("Error: {source}");
            Ok(EXIT_PARTIAL_FAILURE)
        }
        Err(e) => Err(e),
    }
}

async fn run_reconciler(
    reconciler: &Reconciler<'_>,
    destroy: bool,
    confirmed: Option<&Plan>,
    cancel: CancelSignal,
) -> Result<RunReport> {
    let report = match (destroy, confirmed) {
        (false, None) => reconciler.apply(cancel).await,
        (false, Some(plan)) => reconciler.apply_confirmed(plan, cancel).await,
        (true, None) => reconciler.destroy(cancel).await,
        (true, Some(plan)) => reconciler.destroy_confirmed(plan, cancel).await,
    };

    if let Err(e) = &report {
        error!("Run stopped: {}", e);
    }
    report
}

/// Handles state subcommands.
async fn cmd_state(
    config: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let project = load_project(config)?;
    let store = LocalStateStore::with_state_path(&project.settings.state.path);

    match command {
        StateCommands::Show => {
            let state = store.load_file().await?;
            let lock = store.lock_info().await?;
            emit(formatter, &formatter.format_state(state.as_ref(), lock.as_ref()));
        }
        StateCommands::Rm { address } => {
            let address = Address::parse(&address)?;
            let lock = store.acquire_lock(&generate_holder_id(), "state-rm").await?;
            let removed = match store.read(&address).await {
                Ok(Some(_)) => store.delete(&address).await.map(|()| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            store.release_lock(&lock.lock_id).await?;

            if removed? {
                emit(formatter, &formatter.success(&format!("Removed {address} from state")));
            } else {
                emit(formatter, &formatter.warning(&format!("{address} is not in state")));
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(formatter, &formatter.warning("State lock forcefully removed"));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(formatter, &formatter.success("State unlocked"));
            } else {
                emit(formatter, &formatter.error("Provide --lock-id or use --force"));
                return Ok(EXIT_HARD_FAILURE);
            }
        }
    }

    Ok(EXIT_SUCCESS)
}

/// Resolves, loads and overrides the project file.
fn load_project(config: Option<&Path>) -> Result<ProjectConfig> {
    let path = match config {
        Some(p) => p.to_path_buf(),
        None => find_project_file(std::env::current_dir()?)?,
    };
    let base = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(base);
    parser.load_dotenv()?;
    parser.load_with_env(&path)
}

/// Loads the project and rejects it when validation fails.
fn load_valid_project(config: Option<&Path>) -> Result<ProjectConfig> {
    let project = load_project(config)?;
    ConfigValidator::new().validate(&project)?;
    Ok(project)
}

fn build_provider(context: &ProviderContext) -> Arc<SimulatedProvider> {
    let latency = context
        .setting(LATENCY_SETTING)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(Duration::ZERO, Duration::from_millis);
    Arc::new(SimulatedProvider::new().with_latency(latency))
}

/// Asks for confirmation on stdin.
fn confirm(plan: &Plan, destroy: bool) -> Result<bool> {
    let summary = plan.summary();
    if destroy {
        eprint!("\nDestroy {} resources? [y/N] ", summary.destroy);
    } else {
        eprint!("\nApply these changes? [y/N] ");
    }
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Writes formatted output: JSON to stdout, text to stderr.
#[allow(clippy::print_stdout)]
fn emit(formatter: &OutputFormatter, text: &str) {
    if formatter.format() == OutputFormat::Json {
        println!("{text}");
    } else {
        eprintln!("{text}");
    }
}
