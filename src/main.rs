// hermes - telemetry and transfer server

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;

use hermes::app_state::AppState;
use hermes::cli::Cli;
use hermes::config_loader::load_config;
use hermes::event_log::EventLog;
use hermes::fields;
use hermes::logging::init_logging;
use hermes::web::build_router;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            exit(1);
        }
    };
    cli.apply(&mut config);

    let events = Arc::new(EventLog::new(config.log.event_log()));
    if let Err(e) = init_logging(&config.log, events.clone()) {
        eprintln!("Failed to initialize logging: {e}");
        exit(1);
    }

    if let Err(e) = run(config, events.clone()).await {
        events.fatal_and_close("server stopped", fields!("error" => format!("{e:#}")));
        eprintln!("hermes: {e:#}");
        exit(1);
    }
}

async fn run(config: hermes::config_loader::HermesConfig, events: Arc<EventLog>) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .http_addr
        .parse()
        .with_context(|| format!("invalid http_addr {}", config.http_addr))?;
    let env = config.env.clone();

    let state = Arc::new(AppState::open(config, events).context("failed to open state")?);
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, env = %env, "hermes listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down; flushing telemetry");
    state.shutdown().context("failed to flush telemetry")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
