use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use bagcockpit_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use bagcockpit_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use bagcockpit_core::scanner;
use bagcockpit_core::server::{app_router, app_state_for_data_dir};
use bagcockpit_core::store::BagStore;

#[derive(Parser)]
#[command(
    name = "bagcockpit",
    about = "Backend for managing, replaying and testing recorded robot bags",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Index bag metadata into the store without starting the server.
    Ingest(IngestArgs),
}

#[derive(Args)]
struct IngestArgs {
    #[arg(long, help = "Index a single bag directory", conflicts_with = "dir")]
    bag: Option<PathBuf>,

    #[arg(long, help = "Index every bag under a category-structured root")]
    dir: Option<PathBuf>,

    #[arg(long, help = "Print database statistics after indexing")]
    stats: bool,
}

enum IngestTarget {
    Bag(PathBuf),
    Root(PathBuf),
}

fn ingest_target(args: &IngestArgs) -> Result<IngestTarget> {
    match (&args.bag, &args.dir) {
        (Some(bag), None) => Ok(IngestTarget::Bag(bag.clone())),
        (None, Some(dir)) => Ok(IngestTarget::Root(dir.clone())),
        _ => bail!("exactly one of --bag or --dir is required"),
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Ingest(ingest)) => run_ingest(&ingest, &resolved_data_dir),
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn runtime_mode_name(mode: RuntimeLogMode) -> &'static str {
    match mode {
        RuntimeLogMode::Cli => "cli",
        RuntimeLogMode::Server => "server",
    }
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        mode = runtime_mode_name(mode),
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_for_data_dir(config, &data_dir)?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting bagcockpit server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn run_ingest(args: &IngestArgs, data_dir: &Path) -> Result<()> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(data_dir);
    let db_path = resolve_relative_to(data_dir, &config.paths.db_path);
    let store = BagStore::new(&db_path).context("failed to open bag store")?;
    info!(db = %db_path.display(), "Using bag store");

    match ingest_target(args)? {
        IngestTarget::Bag(bag_dir) => {
            info!(bag = %bag_dir.display(), "Indexing bag directory");
            let metadata = scanner::parse_bag_dir(&bag_dir)?;
            store.insert_bag(&metadata)?;
            info!(bag = %metadata.file_path, "Indexed bag");
        }
        IngestTarget::Root(root) => {
            info!(root = %root.display(), "Scanning bag tree");
            let bags = scanner::scan_root(&root)?;
            info!(found = bags.len(), "Found bags");
            for metadata in &bags {
                store.insert_bag(metadata)?;
            }
            info!(indexed = bags.len(), "Indexing complete");
        }
    }

    if args.stats {
        let stats = store.stats()?;
        info!(
            bag_count = stats.bag_count,
            column_count = stats.column_count,
            "Store statistics"
        );
    }

    Ok(())
}
