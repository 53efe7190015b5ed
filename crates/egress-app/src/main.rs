//! Egress - forward HTTP/HTTPS proxy with a host blacklist.
//!
//! `egress run` (the default) serves the proxy. The other subcommands manage
//! the persisted blacklist; a running proxy picks their changes up on its
//! next poll.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use directories::ProjectDirs;
use egress_core::{transfer, Blacklist, BlacklistSnapshot, BlacklistStore, HostPattern};
use egress_proxy::{BlacklistController, EngineConfig, EngineEvent, EventBus, ProxyServer};
use egress_storage::Database;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Egress - forward HTTP/HTTPS proxy with a host blacklist
#[derive(Parser, Debug)]
#[command(name = "egress", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for rotated log files (defaults to the app data directory)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Blacklist database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy (default)
    Run(RunArgs),
    /// Manage blocked host patterns
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },
    /// Import patterns from a blacklist file
    Import {
        file: PathBuf,
        /// Replace the stored blacklist instead of merging into it
        #[arg(long)]
        replace: bool,
    },
    /// Export the stored blacklist to a file
    Export { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum BlockAction {
    /// Block a host or `*.domain` wildcard
    Add { pattern: String },
    /// Unblock a pattern
    Remove { pattern: String },
    /// List blocked patterns
    List,
}

#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// Address to listen on
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// JSON engine configuration to start from
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache entry lifetime in seconds
    #[arg(long)]
    cache_ttl: Option<u64>,

    /// Largest cacheable response in bytes
    #[arg(long)]
    cache_max_entry: Option<usize>,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Idle session timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Seconds between blacklist store checks
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,
}

impl RunArgs {
    /// Builds the engine configuration: file first, then flags on top.
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => EngineConfig::default(),
        };

        if let Some(ip) = self.bind {
            config.listen_addr = SocketAddr::new(ip, config.listen_addr.port());
        }
        if let Some(port) = self.port {
            config.listen_addr.set_port(port);
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache.ttl_secs = ttl;
        }
        if let Some(max) = self.cache_max_entry {
            config.cache.max_entry_size = max;
        }
        if let Some(secs) = self.connect_timeout {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Get the logs directory path.
fn logs_dir(args: &Args) -> Option<PathBuf> {
    args.log_dir.clone().or_else(|| {
        ProjectDirs::from("com", "egress", "egress").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("egress={log_level},warn")));

    if let Some(log_dir) = logs_dir(args) {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("egress")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_database(path: Option<&Path>) -> anyhow::Result<Database> {
    let db = match path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    };
    db.context("opening blacklist database")
}

fn parse_pattern(raw: &str) -> anyhow::Result<HostPattern> {
    HostPattern::parse(raw).with_context(|| format!("invalid host pattern {raw:?}"))
}

fn block(db: &Database, action: BlockAction) -> anyhow::Result<()> {
    match action {
        BlockAction::Add { pattern } => {
            let pattern = parse_pattern(&pattern)?;
            if db.block_host(&pattern)? {
                println!("blocked {}", pattern.as_str());
            } else {
                println!("{} is already blocked", pattern.as_str());
            }
        }
        BlockAction::Remove { pattern } => {
            let pattern = parse_pattern(&pattern)?;
            if db.unblock_host(&pattern)? {
                println!("unblocked {}", pattern.as_str());
            } else {
                println!("{} was not blocked", pattern.as_str());
            }
        }
        BlockAction::List => {
            for host in db.list_blocked()? {
                println!(
                    "{:<40} {}",
                    host.host_name,
                    host.added_on.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
    }
    Ok(())
}

fn import(db: &Database, file: &Path, replace: bool) -> anyhow::Result<()> {
    let patterns =
        transfer::read_file(file).with_context(|| format!("reading {}", file.display()))?;

    if replace {
        let stored = db.replace_blocked(&patterns)?;
        println!("replaced blacklist with {stored} patterns");
    } else {
        let summary = transfer::import_into(db, &patterns)?;
        println!(
            "imported {} patterns ({} already present)",
            summary.added, summary.unchanged
        );
    }
    Ok(())
}

fn export(db: &Database, file: &Path) -> anyhow::Result<()> {
    let patterns = db.blocked_patterns()?;
    transfer::write_file(file, &patterns)
        .with_context(|| format!("writing {}", file.display()))?;
    println!("exported {} patterns to {}", patterns.len(), file.display());
    Ok(())
}

/// Logs engine events until the bus closes.
async fn log_events(events: EventBus) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(EngineEvent::Heartbeat {
                stats,
                active_sessions,
                cache_entries,
            }) => {
                tracing::debug!(
                    active_sessions,
                    cache_entries,
                    stats = %stats.and_then(|s| serde_json::to_string(&s).ok()).unwrap_or_default(),
                    "heartbeat"
                );
            }
            Ok(EngineEvent::Stopped) => return,
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    tracing::debug!(event = %json, "engine event");
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "event logger fell behind");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn run_proxy(db: Database, args: RunArgs) -> anyhow::Result<()> {
    let config = args.engine_config()?;

    let events = EventBus::default();
    let blacklist = Arc::new(Blacklist::new(BlacklistSnapshot::new()));
    let store: Arc<dyn BlacklistStore> = Arc::new(db);
    let controller = Arc::new(
        BlacklistController::new(store, Arc::clone(&blacklist), events.clone())
            .with_poll_interval(Duration::from_secs(args.poll_interval.max(1))),
    );
    let patterns = controller.reload().context("loading blacklist")?;
    tracing::info!(patterns, "blacklist ready");

    let poller = tokio::spawn(Arc::clone(&controller).start_polling());
    let logger = tokio::spawn(log_events(events.clone()));

    let handle = ProxyServer::new(config)
        .with_blacklist(blacklist)
        .with_events(events)
        .start(tokio::runtime::Handle::current())
        .context("starting proxy")?;
    tracing::info!("Egress proxy listening on {}", handle.addr());

    let reactor = handle.reactor_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                reactor.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });

    let result = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .context("joining reactor thread")?;

    poller.abort();
    logger.abort();
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program.
    let _log_guard = init_logging(&args);
    tracing::debug!("Args: {:?}", args);

    let db = open_database(args.db.as_deref())?;

    match args.command {
        None => run_proxy(db, RunArgs::default()).await,
        Some(Command::Run(run)) => run_proxy(db, run).await,
        Some(Command::Block { action }) => block(&db, action),
        Some(Command::Import { file, replace }) => import(&db, &file, replace),
        Some(Command::Export { file }) => export(&db, &file),
    }
}
