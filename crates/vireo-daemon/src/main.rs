//! vireod: the Vireo BBS daemon.
//!
//! Single OS process on a Tokio runtime. Wires the store, the crypto
//! envelope, the packet transport, the sync engine, and the mail worker
//! together, then parks on signals.
//!
//! Exit codes: 0 on orderly shutdown, 1 on fatal configuration or
//! transport errors, 130 on SIGINT/SIGTERM.

mod config;
mod metrics;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info};

use vireo_crypto::master::MasterKey;
use vireo_db::Db;
use vireo_mail::MailService;
use vireo_transport::loopback::LoopbackRadio;
use vireo_transport::{Radio, Transport};
use vireo_types::clock::Clock;
use vireo_types::metrics::Metrics;

use crate::config::DaemonConfig;
use crate::metrics::TracingMetrics;

const EXIT_FATAL: i32 = 1;
const EXIT_SIGNAL: i32 = 130;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return EXIT_FATAL;
        }
    };
    runtime.block_on(run_daemon())
}

async fn run_daemon() -> i32 {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("vireo.toml"));

    let config = match DaemonConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {e}", config_path.display());
            return EXIT_FATAL;
        }
    };

    init_tracing(&config.logging.level);
    info!("vireod starting (callsign {})", config.bbs.callsign);

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config error: {e}");
        }
        return EXIT_FATAL;
    }

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("Cannot create data dir {}: {e}", data_dir.display());
        return EXIT_FATAL;
    }

    // Store.
    let db = match Db::open(&data_dir.join("vireo.db")) {
        Ok(db) => db,
        Err(e) => {
            error!("Cannot open database: {e}");
            return EXIT_FATAL;
        }
    };

    // Operator master key.
    let master = match load_or_create_master_key(&data_dir.join("master.key")) {
        Ok(master) => Arc::new(master),
        Err(e) => {
            error!("Cannot load master key: {e}");
            return EXIT_FATAL;
        }
    };

    // Radio + transport facade.
    let radio: Arc<dyn Radio> = match config.radio.driver.as_str() {
        "loopback" => Arc::new(LoopbackRadio::new()),
        other => {
            error!("Unknown radio driver '{other}'");
            return EXIT_FATAL;
        }
    };
    let (transport, frames, mut transport_fatal) =
        match Transport::start(radio, config.transport_config()) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Cannot start transport: {e}");
                return EXIT_FATAL;
            }
        };

    let metrics: Metrics = Arc::new(TracingMetrics::new());
    let clock = Clock::System;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Sync engine.
    let (engine, events_rx) = vireo_sync::SyncEngine::new(vireo_sync::EngineContext {
        db: db.clone(),
        transport: transport.clone(),
        master: master.clone(),
        settings: config.sync_settings(),
        metrics: metrics.clone(),
        clock: clock.clone(),
    });
    let (sync_handle, engine_task) =
        vireo_sync::engine::spawn(engine, events_rx, frames, shutdown_tx.subscribe());

    // Mail engine. The account service shares the same handles and is
    // instantiated by the session layer on demand.
    let mail = Arc::new(MailService::new(
        db,
        master,
        transport.clone(),
        sync_handle.clone(),
        config.mail_config(),
        metrics.clone(),
        clock,
    ));
    let delivery_task = vireo_mail::delivery::spawn_delivery_worker(mail, shutdown_tx.subscribe());

    info!("vireod up");

    // Park until a signal or a fatal transport failure.
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            EXIT_SIGNAL
        }
        _ = terminate_signal() => {
            info!("Terminate received, shutting down");
            EXIT_SIGNAL
        }
        changed = transport_fatal.changed() => {
            match changed {
                Ok(()) if *transport_fatal.borrow() => {
                    error!("Transport failed permanently");
                    EXIT_FATAL
                }
                _ => EXIT_FATAL,
            }
        }
    };

    // Orderly teardown: stop the workers, close the link.
    let _ = shutdown_tx.send(());
    let _ = engine_task.await;
    let _ = delivery_task.await;
    transport.shutdown();

    info!("vireod stopped");
    exit_code
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

fn init_tracing(level: &str) {
    let directive = format!("vireo={level},vireod={level}");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive)),
        )
        .init();
}

/// Load the operator master key, generating one on first run.
fn load_or_create_master_key(path: &Path) -> anyhow::Result<MasterKey> {
    if path.exists() {
        let content = std::fs::read_to_string(path).context("read master key file")?;
        let bytes = hex::decode(content.trim()).context("decode master key hex")?;
        return MasterKey::from_bytes(&bytes).context("master key length");
    }

    let master = MasterKey::generate();
    std::fs::write(path, hex::encode(master.as_bytes())).context("write master key file")?;

    // Key escrow material: owner-only on platforms that can express it.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    info!("Generated new master key at {}", path.display());
    Ok(master)
}
