//! SARK gateway binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;

use sark_gateway::apikey::{ApiKeyService, InMemoryApiKeyStore};
use sark_gateway::audit::AuditEmitter;
use sark_gateway::auth::{AuthCore, InMemorySessionStore, SessionStore, session};
use sark_gateway::config::Config;
use sark_gateway::http::{AppState, router};
use sark_gateway::policy::{DecisionPoint, HttpRuleEngine};
use sark_gateway::ratelimit::RateLimitGate;
use sark_gateway::siem::{FallbackQueue, SiemForwarder, build_adapters};

#[derive(Parser)]
#[command(name = "sark-gateway", version, about = "Governance gateway for MCP servers")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "SARK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Run,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    if matches!(cli.command, Some(Command::CheckConfig)) {
        config.validate().context("configuration invalid")?;
        println!("configuration ok");
        return Ok(());
    }

    config.validate().context("refusing to serve with invalid configuration")?;
    sark_gateway::setup_tracing(&config.server.log_level, Some(config.server.log_format.as_str()))
        .context("initializing tracing")?;

    serve(config).await
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let (shutdown_tx, _) = broadcast::channel(4);

    // SIEM pipeline: fallback queue → forwarder → emitter.
    let fallback_dir = config
        .fallback
        .dir
        .clone()
        .unwrap_or_else(FallbackQueue::default_dir);
    let fallback = Arc::new(FallbackQueue::new(fallback_dir, config.fallback.rotate_bytes));
    let adapters = build_adapters(&config.siem).context("building SIEM adapters")?;
    let mut forwarder = SiemForwarder::new(
        config.siem.clone(),
        &config.failsafe,
        adapters,
        Arc::clone(&fallback),
        config.fallback.replay_interval,
    );
    let emitter = Arc::new(AuditEmitter::new(forwarder.sender(), Arc::clone(&fallback)));
    let forwarder_handle = forwarder.spawn(&shutdown_tx);
    let forwarder = Arc::new(forwarder);

    // Sessions with a background reaper.
    let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    session::spawn_reaper(
        Arc::clone(&sessions),
        Duration::from_secs(60),
        shutdown_tx.subscribe(),
    );

    // Core subsystems.
    let api_keys = Arc::new(ApiKeyService::new(
        config.api_keys.clone(),
        Arc::new(InMemoryApiKeyStore::new()),
        Arc::clone(&emitter),
    ));
    let auth = Arc::new(
        AuthCore::new(
            config.auth.clone(),
            sessions,
            Arc::clone(&api_keys),
            Arc::clone(&emitter),
        )
        .context("building authentication core")?,
    );
    let engine = Arc::new(HttpRuleEngine::new(&config.policy).context("building rule engine client")?);
    let policy = Arc::new(DecisionPoint::new(
        config.policy.clone(),
        engine,
        Arc::clone(&emitter),
    ));
    let rate_limits = Arc::new(RateLimitGate::new(config.rate_limit.clone()));

    let state = Arc::new(AppState {
        auth,
        api_keys,
        policy,
        rate_limits,
        forwarder,
        emitter,
        admin_role: config.auth.admin_role.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "SARK gateway listening");

    let app = router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("serving")?;

    // Stop background tasks and let the forwarder drain its final batches.
    let _ = shutdown_tx.send(());
    let _ = forwarder_handle.await;
    info!("SARK gateway stopped");
    Ok(())
}
