//! Halldyll infrastructure CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll-infra command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use halldyll_infra::cli::{Cli, Commands, OutputFormatter, StateCommands};
use halldyll_infra::config::{
    ConfigHasher, ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file,
};
use halldyll_infra::error::{ApplyError, ConfigError, HalldyllError, Result};
use halldyll_infra::graph::ResourceGraph;
use halldyll_infra::planner::{ApplyExecutor, ApplyReport, DiffEngine, Plan};
use halldyll_infra::profile::Profile;
use halldyll_infra::provider::ProviderRegistry;
use halldyll_infra::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StackOperation, StackState, StateLock, StateStore,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init {
            path,
            force,
            profile,
            name,
        } => cmd_init(&path, force, &profile, name.as_deref()),
        Commands::Validate { warnings } => {
            cmd_validate(cli.config.as_ref(), warnings, &formatter)
        }
        Commands::Graph => cmd_graph(cli.config.as_ref(), &formatter),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply { yes, concurrency } => {
            cmd_apply(cli.config.as_ref(), yes, concurrency, &formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(cli.config.as_ref(), yes, &formatter).await,
        Commands::Outputs => cmd_outputs(cli.config.as_ref(), &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new stack from a deployment profile.
fn cmd_init(path: &Path, force: bool, profile: &str, name: Option<&str>) -> Result<()> {
    let profile: Profile = profile.parse()?;
    info!("Initializing {profile} stack in: {}", path.display());

    let config_path = path.join("halldyll.infra.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let project = name.map_or_else(|| project_name_for(path), str::to_string);
    std::fs::write(&config_path, profile.render(&project, "dev")?)?;
    eprintln!("Created: {}", config_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".halldyll") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll\n.env\n.halldyll/")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.halldyll/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized ({}: {})", profile, profile.description());
    eprintln!("Next steps:");
    eprintln!("  1. Review halldyll.infra.yaml");
    eprintln!("  2. Run 'halldyll-infra validate' to check the stack");
    eprintln!("  3. Run 'halldyll-infra plan' to see what will change");
    eprintln!("  4. Run 'halldyll-infra apply' to converge");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack: {}", config_file.display());

    let config = load_config(&config_file)?;
    let registry = ProviderRegistry::from_config(&config.provider, None)?;
    let result = ConfigValidator::from_registry(&registry).collect(&config);

    println!("{}", formatter.format_validation(&result, show_warnings));

    if let Some(first) = result.errors.first() {
        return Err(ConfigError::validation(first.message.clone(), first.field.clone()).into());
    }

    // Catch cycles and dangling references too
    let graph = ResourceGraph::from_config(&config)?;
    eprintln!("\nStack summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Environment: {}", config.project.environment);
    if let Some(profile) = &config.project.profile {
        eprintln!("  Profile: {profile}");
    }
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  Dependencies: {}", graph.edge_count());

    Ok(())
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let config = load_config(&config_file)?;
    let graph = ResourceGraph::from_config(&config)?;

    println!("{}", formatter.format_graph(&graph));
    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let stack = StackContext::load(config_path).await?;
    let state = stack.load_state().await?;
    let (plan, _graph) = stack.plan(state.as_ref())?;

    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply the change plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let stack = StackContext::load(config_path).await?;
    let lock = StateLock::acquire(stack.store.as_ref(), None).await?;
    debug!("Acquired state lock {}", lock.lock_id());

    let result = apply_locked(&stack, auto_approve, concurrency, formatter).await;
    lock.release(stack.store.as_ref()).await;

    finish(result?)
}

async fn apply_locked(
    stack: &StackContext,
    auto_approve: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<Option<ApplyReport>> {
    let mut state = stack.load_state().await?.unwrap_or_else(|| {
        StackState::new(&stack.config.project.name, &stack.config.project.environment)
    });

    let (plan, graph) = stack.plan(Some(&state))?;
    if plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(None);
    }

    println!("{}", formatter.format_plan(&plan, false));
    plan.ensure_guardrails()?;

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(None);
    }

    let mut executor = stack.executor();
    if let Some(concurrency) = concurrency {
        executor = executor.with_concurrency(concurrency);
    }

    let report = executor
        .execute(&plan, &graph, &mut state, StackOperation::Apply)
        .await?;

    println!("{}", formatter.format_report(&report));
    Ok(Some(report))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let stack = StackContext::load(config_path).await?;
    let lock = StateLock::acquire(stack.store.as_ref(), None).await?;

    let result = destroy_locked(&stack, auto_approve, formatter).await;
    lock.release(stack.store.as_ref()).await;

    finish(result?)
}

async fn destroy_locked(
    stack: &StackContext,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<Option<ApplyReport>> {
    let Some(mut state) = stack.load_state().await? else {
        eprintln!("No state found, nothing to destroy.");
        return Ok(None);
    };

    let graph = ResourceGraph::from_config(&stack.config)?;
    let diff = DiffEngine::new(&stack.registry).compute_destroy(&state);
    let plan = Plan::from_diff(
        &diff,
        &graph,
        Some(&state),
        &stack.registry,
        &stack.config,
        "",
    )?;

    if plan.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(None);
    }

    println!("{}", formatter.format_plan(&plan, false));
    plan.ensure_guardrails()?;

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(None);
    }

    let report = stack
        .executor()
        .execute(&plan, &graph, &mut state, StackOperation::Destroy)
        .await?;

    println!("{}", formatter.format_report(&report));
    Ok(Some(report))
}

/// Show exports from the last apply.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let stack = StackContext::load(config_path).await?;
    let exports = stack
        .load_state()
        .await?
        .map(|s| s.exports)
        .unwrap_or_default();

    println!("{}", formatter.format_exports(&exports));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let stack = StackContext::load(config_path).await?;
    let store = stack.store.as_ref();

    match command {
        StateCommands::Show => {
            if let Some(state) = stack.load_state().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let lock = StateLock::acquire(store, holder.as_deref()).await?;
            eprintln!(
                "State locked: {} (holder {}, expires {})",
                lock.lock_id(),
                lock.info().holder,
                lock.info().expires_at
            );
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a stack command needs.
struct StackContext {
    config: StackConfig,
    registry: ProviderRegistry,
    store: Box<dyn StateStore>,
}

impl StackContext {
    /// Loads and validates the stack, then opens its provider and state backend.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let config = load_config(&config_file)?;

        let registry = ProviderRegistry::from_config(
            &config.provider,
            Some(&local_state_dir(&config, &config_file)),
        )?;
        ConfigValidator::from_registry(&registry).validate(&config)?;

        let store = open_store(&config, &config_file).await?;
        debug!("Using {} state backend", store.backend_type());

        Ok(Self {
            config,
            registry,
            store,
        })
    }

    /// Loads the last snapshot, refusing one written for another stack.
    async fn load_state(&self) -> Result<Option<StackState>> {
        let state = self.store.load().await?;
        if let Some(state) = &state {
            state.verify_stack(&self.config.project.name, &self.config.project.environment)?;
        }
        Ok(state)
    }

    /// Builds the graph and the plan against a snapshot.
    fn plan(&self, state: Option<&StackState>) -> Result<(Plan, ResourceGraph)> {
        let graph = ResourceGraph::from_config(&self.config)?;
        let config_hash = ConfigHasher::new().hash_config(&self.config);
        let diff = DiffEngine::new(&self.registry).compute_diff(&graph, state)?;
        let plan = Plan::from_diff(
            &diff,
            &graph,
            state,
            &self.registry,
            &self.config,
            &config_hash,
        )?;
        Ok((plan, graph))
    }

    /// Creates an executor that stops launching work on Ctrl-C.
    fn executor(&self) -> ApplyExecutor<'_> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, waiting for in-flight operations to finish");
                token.cancel();
            }
        });

        ApplyExecutor::new(
            &self.registry,
            self.store.as_ref(),
            &self.config.executor,
            &self.config.provider,
        )
        .with_cancellation(cancel)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Parses a stack file, applying `.env` and environment overrides.
fn load_config(config_file: &Path) -> Result<StackConfig> {
    debug!("Loading stack from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(stack_dir(config_file));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Opens the state backend named by the stack.
async fn open_store(config: &StackConfig, config_file: &Path) -> Result<Box<dyn StateStore>> {
    let stack_name = config.qualified_name();

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => Box::new(LocalStateStore::with_base_dir(local_state_dir(
            config,
            config_file,
        ))),
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| HalldyllError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref().map_or_else(
                || stack_name.clone(),
                |p| format!("{}/{stack_name}", p.trim_end_matches('/')),
            );
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, Some(&prefix), region).await?)
        }
    };

    Ok(store)
}

/// Local directory for the stack's files: the state snapshot for the local
/// backend and the simulated cloud for either backend.
fn local_state_dir(config: &StackConfig, config_file: &Path) -> PathBuf {
    let root = match (&config.state.backend, &config.state.path) {
        (StateBackend::Local, Some(path)) => stack_dir(config_file).join(path),
        _ => stack_dir(config_file).join(STATE_DIR),
    };
    root.join(config.qualified_name())
}

/// Directory holding the stack file.
fn stack_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Default project name for `init`: the target directory's name.
fn project_name_for(path: &Path) -> String {
    let dir = if path == Path::new(".") {
        std::env::current_dir().ok()
    } else {
        Some(path.to_path_buf())
    };

    dir.and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .map(|n| {
            n.split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|n| n.starts_with(|c: char| c.is_ascii_lowercase()))
        .unwrap_or_else(|| String::from("halldyll"))
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Maps an unsuccessful run to a non-zero exit.
fn finish(report: Option<ApplyReport>) -> Result<()> {
    match report {
        Some(report) if report.cancelled => Err(ApplyError::Cancelled {
            reason: String::from("interrupted"),
        }
        .into()),
        Some(report) if !report.is_success() => Err(ApplyError::PartialFailure {
            failed: report.failed(),
            skipped: report.skipped(),
        }
        .into()),
        _ => Ok(()),
    }
}
