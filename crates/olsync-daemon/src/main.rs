//! olsync: keeps a local directory in two-way sync with a collaborative
//! LaTeX project.
//!
//! Connects over the live socket when it can and falls back to plain HTTP
//! calls when it cannot, runs a full pull on startup and after every
//! reconnect, then mirrors local and remote changes as they happen.

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use olsync_core::{
    ConflictResolver, ConnectError, ConnectionManager, LocalOnlyAction, PolicyResolver,
    ReconnectPolicy, RemoteDeletedAction, Resolution, ServerEvent, SyncEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use olsync_daemon::{
    DaemonConfig, DefaultIgnore, FileWatcher, HttpApi, NativeFs, PersistedState,
    SocketIoConnector, StateStorage, TerminalResolver,
};

/// How often to retry the live connection while running without one.
const OFFLINE_RETRY: Duration = Duration::from_secs(60);

/// Backoff attempts after a dropped socket before falling back to HTTP.
const RECONNECT_ATTEMPTS: u32 = 5;

/// How often sync state is written back when it changed.
const SAVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "olsync")]
#[command(about = "Two-way sync between a local directory and a collaborative LaTeX project")]
struct Args {
    /// Directory to sync (supports ~ for home directory)
    #[arg(default_value = ".")]
    dir: String,

    /// Base URL of the service
    #[arg(long, env = "OLSYNC_SERVER", default_value = "https://www.overleaf.com")]
    server: String,

    /// Project id
    #[arg(long, env = "OLSYNC_PROJECT")]
    project: String,

    /// Session cookie header value
    #[arg(long, env = "OLSYNC_COOKIE", hide_env_values = true)]
    cookie: String,

    /// CSRF token for mutating requests
    #[arg(long, env = "OLSYNC_CSRF", hide_env_values = true)]
    csrf: Option<String>,

    /// Main document, whose build artefacts are never synced
    #[arg(long, default_value = "main.tex")]
    main_doc: String,

    /// How to settle conflicts found while pulling
    #[arg(long, value_enum, default_value_t = OnConflict::Ask)]
    on_conflict: OnConflict,

    /// Pull once and exit instead of watching for changes
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnConflict {
    /// Ask on the terminal
    Ask,
    /// Always take the remote version
    Remote,
    /// Always push the local version
    Local,
    /// Leave conflicting files alone
    Skip,
}

impl OnConflict {
    fn resolver(self) -> Arc<dyn ConflictResolver> {
        let policy = |conflict| PolicyResolver {
            conflict,
            remote_deleted: RemoteDeletedAction::Keep,
            local_only: LocalOnlyAction::Ignore,
        };
        match self {
            OnConflict::Ask => Arc::new(TerminalResolver::new()),
            OnConflict::Remote => Arc::new(policy(Resolution::UseRemote)),
            OnConflict::Local => Arc::new(policy(Resolution::UseLocal)),
            OnConflict::Skip => Arc::new(policy(Resolution::Skip)),
        }
    }
}

/// Daemon state holding all components.
struct Daemon {
    config: Arc<DaemonConfig>,
    engine: Arc<SyncEngine<NativeFs>>,
    manager: ConnectionManager,
    storage: StateStorage,
}

impl Daemon {
    /// Connect and attach the engine, falling back to HTTP-only operation.
    ///
    /// Authentication failures are fatal.
    async fn attach(&self) -> Result<()> {
        match self.manager.connect().await {
            Ok(snapshot) => {
                let Some(session) = self.manager.session() else {
                    bail!("Connected without a session");
                };
                self.engine.attach(session, &snapshot);
                Ok(())
            }
            Err(ConnectError::Authentication(reason)) => {
                bail!("Authentication failed: {}", reason)
            }
            Err(e) => {
                warn!("Live connection unavailable ({}), continuing over HTTP", e);
                self.engine
                    .attach_offline()
                    .await
                    .context("Failed to index the project")?;
                Ok(())
            }
        }
    }

    /// Full reconciliation, then persist what is now known to be in sync.
    async fn pull(&self) {
        match self.engine.pull_all().await {
            Ok(report) => info!("Pull finished: {}", report),
            Err(e) => error!("Pull failed: {}", e),
        }
        self.save_state();
    }

    fn current_state(&self) -> PersistedState {
        PersistedState {
            project_id: self.config.project_id.clone(),
            last_synced: self.engine.last_synced(),
            base_content: self.engine.base_content(),
        }
    }

    fn save_state(&self) {
        if let Err(e) = self.storage.save(&self.current_state()) {
            warn!("Failed to save sync state: {}", e);
        }
    }

    /// Persist what the pipelines synced since the last write.
    fn checkpoint(&self) {
        match self.storage.save_if_changed(&self.current_state()) {
            Ok(true) => debug!("Checkpointed sync state"),
            Ok(false) => {}
            Err(e) => warn!("Failed to save sync state: {}", e),
        }
    }

    /// The socket went away; reconnect with backoff and resync.
    async fn on_connection_lost(&self) -> Result<()> {
        match self.manager.reconnect_with_backoff().await {
            Ok(Some(snapshot)) => {
                if let Some(session) = self.manager.session() {
                    self.engine.attach(session, &snapshot);
                    self.pull().await;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(ConnectError::Authentication(reason)) => {
                bail!("Authentication failed while reconnecting: {}", reason)
            }
            Err(e) => {
                warn!("Reconnect gave up ({}), continuing over HTTP", e);
                self.engine.attach_offline().await?;
                Ok(())
            }
        }
    }

    /// Periodic retry of the live connection while running over HTTP.
    async fn retry_live(&self) {
        if self.manager.is_connected() {
            return;
        }
        match self.manager.reconnect().await {
            Ok(Some(snapshot)) => {
                if let Some(session) = self.manager.session() {
                    info!("Live connection restored");
                    self.engine.attach(session, &snapshot);
                    self.pull().await;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Still without live connection: {}", e),
        }
    }

    async fn shutdown(&self) {
        self.save_state();
        self.engine.detach().await;
        self.manager.disconnect().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,olsync_core=debug,olsync_daemon=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::new(&args.server, args.project, args.cookie, args.csrf, &args.dir)?
        .with_main_doc(&args.main_doc);
    let config = Arc::new(config);

    info!("Starting olsync");
    info!("Sync root: {:?}", config.sync_root);
    info!("Project: {} on {}", config.project_id, config.server);

    std::fs::create_dir_all(&config.sync_root)
        .with_context(|| format!("Failed to create {:?}", config.sync_root))?;
    let sync_root = config.sync_root.canonicalize()?;

    let api = Arc::new(HttpApi::new(Arc::clone(&config))?);
    let engine = SyncEngine::new(
        Arc::new(NativeFs::new(sync_root.clone())),
        api,
        args.on_conflict.resolver(),
        config.sync.clone(),
    )
    .with_ignore(Arc::new(DefaultIgnore::new(&config.main_doc)));
    let engine = Arc::new(engine);

    let storage = StateStorage::new(&sync_root);
    if let Some(state) = storage.load_for(&config.project_id) {
        info!("Restored sync state ({} tracked paths)", state.base_content.len());
        engine.restore(state.base_content, state.last_synced);
    }

    let _status_log = engine.status().subscribe(|event| {
        let message = event.message.as_deref().unwrap_or("");
        match &event.path {
            Some(path) => debug!("Status {} ({}): {}", event.status, path, message),
            None => debug!("Status {}: {}", event.status, message),
        }
    });

    let connector = Arc::new(SocketIoConnector::new(Arc::clone(&config))?);
    let manager = ConnectionManager::new(connector, config.sync.handshake_timeout)
        .with_reconnect(ReconnectPolicy::limited(RECONNECT_ATTEMPTS));
    let mut server_events = manager.subscribe();

    let daemon = Daemon {
        config: Arc::clone(&config),
        engine: Arc::clone(&engine),
        manager,
        storage,
    };

    // Authentication failure aborts here, before any watcher exists
    daemon.attach().await?;
    daemon.pull().await;

    if args.once {
        daemon.shutdown().await;
        return Ok(());
    }

    let mut watcher = FileWatcher::new(sync_root)?;
    info!("File watcher started");

    let mut offline_retry = tokio::time::interval(OFFLINE_RETRY);
    offline_retry.tick().await;
    let mut save_tick = tokio::time::interval(SAVE_INTERVAL);
    save_tick.tick().await;

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Local changes run concurrently; the path locks keep them apart
            Some(event) = watcher.event_rx().recv() => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.handle_local(event).await;
                });
            }

            // Server events are applied in arrival order
            result = server_events.recv() => {
                match result {
                    Ok(event @ (ServerEvent::Closed | ServerEvent::ForceDisconnect { .. })) => {
                        engine.handle_remote(event).await;
                        daemon.save_state();
                        if let Err(e) = daemon.on_connection_lost().await {
                            error!("{}", e);
                            break;
                        }
                    }
                    Ok(event) => engine.handle_remote(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} server events, pulling to catch up", missed);
                        daemon.pull().await;
                    }
                    Err(RecvError::Closed) => {
                        error!("Server event channel closed");
                        break;
                    }
                }
            }

            _ = offline_retry.tick() => {
                daemon.retry_live().await;
            }

            _ = save_tick.tick() => {
                daemon.checkpoint();
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    daemon.shutdown().await;
    Ok(())
}
