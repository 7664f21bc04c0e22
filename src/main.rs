//! VPN Blocker CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vpn_blocker::events::HostEvent;
use vpn_blocker::providers::iphub::IpHubProvider;
use vpn_blocker::{
    AuditTag, Config, EnforceError, EnforcementMode, Enforcer, Key, Notifier, OverrideTable,
    Resolver, SessionGuard, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "vpn-blocker")]
#[command(about = "VPN/proxy detection for game servers - cached IPHub lookups with monitor/enforce policy")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vpn-blocker.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify a single address and print the verdict
    Check { address: String },
    /// Show or set the enforcement mode
    Mode { mode: Option<EnforcementMode> },
    /// Whitelist an address or CIDR network
    AllowIp { address: String },
    /// Remove an address or network from the whitelist
    RevokeIp { address: String },
    /// Whitelist a player identity
    AllowId { identity: String },
    /// Remove a player identity from the whitelist
    RevokeId { identity: String },
    /// Read host events from stdin (default)
    Run,
}

/// Stand-in for the host's kick: logs the decision.
struct LogEnforcer;

impl Enforcer for LogEnforcer {
    fn enforce(&self, identity: &str) -> Result<(), EnforceError> {
        warn!(identity = %identity, "VPN/Proxy detected. Disconnecting player");
        Ok(())
    }
}

/// Stand-in for admin chat notifications.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, identity: &str, key: &Key, message: &str) {
        warn!(identity = %identity, ip = %key, "[admin] {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // Handle --validate
    if args.validate {
        if !config.iphub.has_api_key() {
            warn!("iphub.api_key is not set; every lookup will fail open");
        }
        info!("Configuration is valid");
        return Ok(());
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check { address } => check(&config, &address).await,
        Command::Mode { mode: None } => {
            println!("Current mode: {}", config.settings.mode);
            Ok(())
        }
        Command::Mode { mode: Some(mode) } => {
            config.settings.mode = mode;
            config.save(&args.config)?;
            println!("Mode set to {}", mode);
            Ok(())
        }
        Command::AllowIp { address } => {
            edit_overrides(&mut config, &args.config, |t| t.add_ip(&address), "whitelisted", &address)
        }
        Command::RevokeIp { address } => edit_overrides(
            &mut config,
            &args.config,
            |t| t.remove_ip(&address),
            "removed from the whitelist",
            &address,
        ),
        Command::AllowId { identity } => edit_overrides(
            &mut config,
            &args.config,
            |t| t.add_identity(&identity),
            "whitelisted",
            &identity,
        ),
        Command::RevokeId { identity } => edit_overrides(
            &mut config,
            &args.config,
            |t| Ok(t.remove_identity(&identity)),
            "removed from the whitelist",
            &identity,
        ),
        Command::Run => run(config, &args.config).await,
    }
}

fn edit_overrides<F>(
    config: &mut Config,
    path: &Path,
    edit: F,
    verb: &str,
    subject: &str,
) -> Result<()>
where
    F: FnOnce(&OverrideTable) -> Result<bool, vpn_blocker::overrides::OverrideError>,
{
    let table = OverrideTable::from_config(&config.overrides);
    if !edit(&table)? {
        println!("{} is unchanged", subject);
        return Ok(());
    }

    config.overrides = table.snapshot();
    config.save(path)?;
    println!("{} {}", subject, verb);
    Ok(())
}

/// Open the persistent cache, falling back to memory so lookups keep working.
fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    match SqliteStore::open(&config.store.path) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            error!(
                path = %config.store.path.display(),
                error = %e,
                "Failed to open store, using a non-durable in-memory cache"
            );
            Ok(Arc::new(SqliteStore::in_memory()?))
        }
    }
}

fn build_resolver(config: &Config, store: Arc<SqliteStore>) -> Result<Arc<Resolver>> {
    if !config.iphub.has_api_key() {
        warn!("iphub.api_key is not set; every lookup will fail open");
    }
    let source = IpHubProvider::new(config.iphub.clone())?;

    Ok(Arc::new(Resolver::new(
        store,
        Arc::new(source),
        config.store.freshness(),
        config.cache.max_entries,
    )))
}

async fn check(config: &Config, address: &str) -> Result<()> {
    let key = Key::parse(address)?;
    let store = open_store(config)?;
    let resolver = build_resolver(config, Arc::clone(&store))?;

    let resolution = resolver.resolve(&key, &AuditTag::new("cli", "cli")).await;
    let classification = resolution.classification;

    println!(
        "{}: {} (severity: {}, confidence: {:?}, via {:?})",
        key,
        if classification.flagged { "VPN/proxy" } else { "clean" },
        classification
            .severity
            .map(|s| s.to_string())
            .unwrap_or_else(|| "N/A".to_string()),
        classification.confidence,
        resolution.tier,
    );

    if let Some(record) = store.get(&key.ip()).await? {
        println!(
            "stored: checked_at={} identity={} label={}",
            record.checked_at.to_rfc3339(),
            record.identity,
            record.label
        );
    }

    Ok(())
}

async fn run(mut config: Config, config_path: &Path) -> Result<()> {
    let store = open_store(&config)?;
    let resolver = build_resolver(&config, store)?;
    let overrides = Arc::new(OverrideTable::from_config(&config.overrides));
    let guard = SessionGuard::new(
        resolver,
        overrides,
        Arc::new(LogEnforcer),
        Arc::new(LogNotifier),
        &config.settings,
    );

    info!(
        mode = %guard.mode(),
        enabled = guard.is_enabled(),
        "VPN blocker ready, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut purge = tokio::time::interval(Duration::from_secs(600));
    let mut pending: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let event = match HostEvent::parse_line(&line) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(line = %line, error = %e, "Ignoring malformed event");
                        continue;
                    }
                };
                handle_event(&guard, &mut config, config_path, event, &mut pending);
                pending.retain(|h| !h.is_finished());
            }
            _ = purge.tick() => guard.resolver().purge_expired(),
        }
    }

    for handle in pending {
        if let Err(e) = handle.await {
            warn!(error = %e, "Lookup task failed");
        }
    }

    let stats = guard.resolver().stats();
    info!(
        resolutions = stats.resolutions,
        memory_hits = stats.memory_hits,
        store_hits = stats.store_hits,
        source_calls = stats.source_calls,
        source_failures = stats.source_failures,
        memory_entries = stats.memory_entries,
        "Event stream closed"
    );

    Ok(())
}

fn handle_event(
    guard: &Arc<SessionGuard>,
    config: &mut Config,
    config_path: &Path,
    event: HostEvent,
    pending: &mut Vec<JoinHandle<()>>,
) {
    match event {
        HostEvent::Connect {
            identity,
            address,
            label,
        } => pending.extend(guard.on_connect(&identity, &label, &address)),
        HostEvent::Recheck {
            identity,
            address,
            label,
        } => pending.extend(guard.on_recheck(&identity, &label, &address)),
        HostEvent::Disconnect { identity } => {
            guard.on_disconnect(&identity);
        }
        HostEvent::Mode(mode) => {
            pending.extend(guard.set_mode(mode));
            config.settings.mode = mode;
            if let Err(e) = config.save(config_path) {
                error!(error = %e, "Failed to save configuration");
            }
        }
        HostEvent::Reload => match Config::load(config_path) {
            Ok(reloaded) => {
                guard.overrides().replace(&reloaded.overrides);
                guard.set_enabled(reloaded.settings.enabled);
                pending.extend(guard.set_mode(reloaded.settings.mode));
                *config = reloaded;
                info!("Configuration reloaded");
            }
            Err(e) => error!(error = %e, "Failed to reload configuration"),
        },
    }
}
