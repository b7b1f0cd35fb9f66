//! Command line driver for the forum upgrade engine.
//!
//! Each tool invocation is bounded by the configured time budget. This binary plays the role
//! of the browser that keeps requesting the next step: it invokes the controller in a loop
//! until the tool finishes or fails, printing progress as it goes.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use upgrader::{
    Controller, InvocationReport, MaintenanceState, Operator, Outcome, Registry, SchemaVersion,
    SqliteDatabase, ToolKind, UpgradeConfig,
};

#[derive(Parser)]
#[command(name = "upgrader", version, about = "Install or upgrade a forum database")]
struct Cli {
    /// Configuration file; defaults are used when it does not exist
    #[arg(short, long, env = "UPGRADER_CONFIG", default_value = "upgrader.toml")]
    config: PathBuf,

    /// Forum database, overriding the configuration file
    #[arg(long, env = "UPGRADER_DATABASE")]
    database: Option<PathBuf>,

    /// Maintenance state file, overriding the configuration file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Member id of the operator running the tool
    #[arg(long, env = "UPGRADER_OPERATOR_ID", default_value_t = 1)]
    operator_id: i64,

    #[arg(long, env = "UPGRADER_OPERATOR_NAME", default_value = "admin")]
    operator_name: String,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade an existing forum to the target version
    Upgrade(RunArgs),
    /// Create a new forum at the target version
    Install(RunArgs),
    /// Show the maintenance run in progress, if any
    Status,
    /// List the migration steps an upgrade would run, without running them
    Preview,
    /// Forget the maintenance run in progress
    Reset,
    /// List every registered migration step (no database required)
    Steps,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Stop after a single invocation
    #[arg(long)]
    once: bool,

    /// Print one JSON report per invocation instead of progress lines
    #[arg(long)]
    json: bool,

    /// Consecutive non-fatal failures tolerated before giving up
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Version to install or upgrade to
    #[arg(long)]
    target: Option<SchemaVersion>,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "upgrader=info",
        1 => "upgrader=debug",
        _ => "upgrader=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = UpgradeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.database = database;
    }
    if let Some(state_file) = cli.state_file {
        config.state_file = state_file;
    }
    let operator = Operator::new(cli.operator_id, cli.operator_name);

    match cli.command {
        Commands::Upgrade(args) => {
            let config = with_target(config, &args)?;
            drive(&Controller::upgrade(config), &operator, &args)
        }
        Commands::Install(args) => {
            let config = with_target(config, &args)?;
            drive(&Controller::install(config), &operator, &args)
        }
        Commands::Status => status(config),
        Commands::Preview => preview(config),
        Commands::Reset => {
            Controller::upgrade(config).reset()?;
            println!("Maintenance state cleared.");
            Ok(())
        }
        Commands::Steps => {
            list_steps();
            Ok(())
        }
    }
}

fn with_target(mut config: UpgradeConfig, args: &RunArgs) -> Result<UpgradeConfig> {
    if let Some(target) = args.target {
        config.target = target;
    }
    config.validate()?;
    Ok(config)
}

fn open(config: &UpgradeConfig) -> Result<SqliteDatabase> {
    SqliteDatabase::open(&config.database, config.busy_timeout())
        .with_context(|| format!("opening {}", config.database.display()))
}

/// Invoke the controller until it finishes, fails fatally, or runs out of retries.
fn drive(controller: &Controller, operator: &Operator, args: &RunArgs) -> Result<()> {
    let mut failures = 0;
    loop {
        // a fresh connection per invocation, as separate requests would have
        let mut db = open(controller.config())?;
        let report = controller.invoke(&mut db, operator);
        drop(db);

        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print_report(&report);
        }

        match report.outcome {
            Outcome::Continue => failures = 0,
            Outcome::Finished => {
                if !args.json {
                    println!("{} complete.", title(controller.tool()));
                }
                return Ok(());
            }
            Outcome::Refused { message } => bail!(message),
            Outcome::Failed { message, fatal: true } => bail!(message),
            Outcome::Failed {
                message,
                fatal: false,
            } => {
                failures += 1;
                if failures > args.max_retries {
                    bail!("giving up after {} failed attempts: {}", failures, message);
                }
                tracing::warn!(attempt = failures, "Retrying after error: {}", message);
            }
        }

        if args.once {
            return Ok(());
        }
    }
}

fn title(tool: ToolKind) -> &'static str {
    match tool {
        ToolKind::Install => "Installation",
        ToolKind::Upgrade => "Upgrade",
    }
}

fn print_report(report: &InvocationReport) {
    let position = if report.total_items > 0 {
        format!(" ({}/{})", report.substep, report.total_items)
    } else {
        String::new()
    };
    println!(
        "[{:>5.1}%] {}{}",
        report.progress * 100.0,
        report.phase_name,
        position
    );
}

fn status(config: UpgradeConfig) -> Result<()> {
    let Some(state) = Controller::upgrade(config.clone()).status()? else {
        println!("No install or upgrade in progress.");
        return Ok(());
    };
    let controller = match state.tool {
        ToolKind::Install => Controller::install(config),
        ToolKind::Upgrade => Controller::upgrade(config),
    };
    print_status(&controller, &state);
    Ok(())
}

fn print_status(controller: &Controller, state: &MaintenanceState) {
    let phase = controller
        .phases()
        .get(state.step)
        .map(|p| p.name)
        .unwrap_or("finishing");

    println!("{} in progress", title(state.tool));
    println!("  Operator:  {} (id {})", state.user_name, state.user_id);
    println!("  Started:   {}", state.started.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:   {}", state.updated.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Phase:     {} ({}/{})", phase, state.step + 1, controller.phases().len());
    if state.total_items > 0 {
        println!("  Position:  {}/{}", state.substep, state.total_items);
    }
    if state.start > 0 {
        println!("  Offset:    {}", state.start);
    }
    println!("  Progress:  {:.1}%", controller.progress(state) * 100.0);
    if !state.skipped.is_empty() {
        println!("  Skipped ({}):", state.skipped.len());
        for id in &state.skipped {
            println!("    {}", id);
        }
    }
}

fn preview(config: UpgradeConfig) -> Result<()> {
    let target = config.target;
    let mut db = open(&config)?;
    let previews = Controller::upgrade(config).preview(&mut db)?;
    if previews.is_empty() {
        println!("Nothing to do: the forum is already at {}.", target);
        return Ok(());
    }

    let pending = previews.iter().filter(|p| p.candidate).count();
    println!("{} of {} steps would run:", pending, previews.len());
    for step in &previews {
        let marker = match (step.candidate, step.resuming) {
            (true, true) => "resume",
            (true, false) => "run",
            (false, _) => "skip",
        };
        println!("  [{:>6}] {}", marker, step.id);
        if let Some(description) = step.description {
            println!("           {}", description);
        }
    }
    Ok(())
}

fn list_steps() {
    let registry = Registry::builtin();
    for namespace in registry.namespaces() {
        let steps = (namespace.steps)();
        println!("{} ({} steps):", namespace.version.namespace(), steps.len());
        for step in steps {
            println!("  {}", step.name());
            if let Some(description) = step.description() {
                println!("      {}", description);
            }
        }
    }
}
