use std::{env, fs, path::PathBuf, process};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use leadflow::{
    apps::App,
    config::{ConfigManager, EngineConfig, EnvConfigManager},
    flow_commands::validate_flow_file,
    logger::init_tracing,
    schema::write_schema,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "leadflow",
    about = "Routes leads through user-built flows over a message broker",
    version = "0.1.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine
    Run(RunArgs),

    /// Emit JSON-Schema for flow definitions, documents and wire messages
    Schema(SchemaArgs),

    /// Work with flow definition files
    Flow(FlowArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Root directory (defaults to $LEADFLOW_ROOT or ./leadflow)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// OpenTelemetry OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Use the in-process broker instead of NATS
    #[arg(long, default_value_t = false)]
    memory_broker: bool,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory (defaults to `<root>/schemas`)
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    Validate { file: PathBuf },
}

/// Resolve the leadflow root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("LEADFLOW_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./leadflow")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let out_dir = args.out.unwrap_or_else(|| resolve_root_dir().join("schemas"));
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
        Commands::Flow(flow_args) => match flow_args.command {
            FlowCommands::Validate { file } => {
                validate_flow_file(&file)?;
                println!("✅ Flow file is valid.");
                Ok(())
            }
        },
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let root = args.root.unwrap_or_else(resolve_root_dir);
    fs::create_dir_all(&root).with_context(|| format!("could not create {}", root.display()))?;

    // config
    let config_mgr = ConfigManager(EnvConfigManager::new(root.join("config").join(".env")));
    let mut config = EngineConfig::from_manager(&config_mgr).await?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.otel_endpoint.is_some() {
        config.otel_endpoint = args.otel_endpoint;
    }

    // tracing / logger
    let telemetry = init_tracing(
        &root,
        "logs/leadflow.log",
        &config.log_level,
        config.otel_endpoint.as_deref(),
    )?;
    info!("leadflow starting up…");

    // bootstrap
    let app = if args.memory_broker {
        App::in_memory(config).0
    } else {
        App::with_nats(config)
    };
    if let Err(err) = app.bootstrap().await {
        error!("Failed to bootstrap leadflow: {:#}", err);
        telemetry.shutdown();
        process::exit(1);
    }
    let seeded = app.seed_flows(&root.join("flows")).await?;
    info!("{} flow(s) seeded from {}", seeded.len(), root.join("flows").display());

    info!("leadflow running; press Ctrl-C to exit");
    println!("leadflow running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    info!("leadflow shutting down");
    app.shutdown().await;
    telemetry.shutdown();
    println!("Goodbye!");
    Ok(())
}
