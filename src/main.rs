//! Apogee — real-time multiplier-crash wagering server.
//!
//! Wires the pieces together: durable store, credential service, session
//! registry, the single round-engine task, and the HTTP/websocket listener.

use apogee::api::{self, AppState};
use apogee::auth::AuthService;
use apogee::config::Config;
use apogee::engine::{self, Engine, EngineConfig};
use apogee::fair::FairnessOracle;
use apogee::net::rate_limit::RouteLimiter;
use apogee::net::session::SessionRegistry;
use apogee::store::Store;
use apogee::types::now_ms;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine mailbox depth. Overflow refuses client actions; it never stalls
/// the round.
const ENGINE_MAILBOX: usize = 256;

#[derive(Parser)]
#[command(name = "apogee", version, about = "Apogee: multiplier-crash wagering server")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("apogee=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return;
        }
    };
    if let Some(port) = args.port {
        cfg.listen_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Err(e) = cfg.validate() {
        error!("invalid configuration: {e}");
        return;
    }

    info!("════════════════════════════════════════════════════════════");
    info!("  Apogee v{VERSION} — crash game server");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Port: {} | Data: {} | House edge: {}bp",
        cfg.listen_port,
        cfg.data_dir.display(),
        cfg.game.house_edge_bp
    );

    let store = match Store::open(&cfg.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open store at {}: {e}", cfg.data_dir.display());
            return;
        }
    };

    match store.recover_stale_rounds(now_ms()) {
        Ok(0) => {}
        Ok(n) => info!("recovered {n} interrupted rounds"),
        Err(e) => error!("round recovery failed: {e}"),
    }

    let auth = Arc::new(AuthService::new(cfg.token.clone()));
    let registry = Arc::new(SessionRegistry::new());
    let limiter = Arc::new(RouteLimiter::new(&cfg.rate));

    // Resume the commitment nonce where the round sequence left off.
    let last_round = store.last_round_number().unwrap_or(0);
    let oracle = FairnessOracle::new(cfg.game.house_edge_bp, cfg.game.client_seed.clone())
        .with_nonce(last_round);

    let engine = Engine::new(
        EngineConfig::from_config(&cfg),
        store.clone(),
        oracle,
        registry.clone(),
    );
    let (engine_handle, commands) = engine::channel(ENGINE_MAILBOX);
    let engine_task = tokio::spawn(engine::run(engine, commands));
    info!("round engine started at round {}", last_round + 1);

    // Idle-session reaper
    let auth_reaper = auth.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            let reaped = auth_reaper.reap(now_ms());
            if reaped > 0 {
                info!("reaped {reaped} idle auth sessions");
            }
        }
    });

    // Status printer
    let status_registry = registry.clone();
    let status_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let sessions = status_registry.count();
            let round = status_store.last_round_number().unwrap_or(0);
            info!("Status: {sessions} sessions | round {round}");
        }
    });

    let cfg = Arc::new(cfg);
    let state = AppState {
        cfg: cfg.clone(),
        store,
        auth,
        registry,
        engine: engine_handle.clone(),
        limiter,
    };
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return;
        }
    };
    info!("listening on {addr}");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        error!("server error: {e}");
    }

    // Drain the current round before exit so no wager dangles.
    info!("shutting down...");
    engine_handle.shutdown().await;
    let _ = engine_task.await;
    info!("bye");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}
