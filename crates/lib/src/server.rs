//! HTTP server and process bootstrap.
//!
//! One port serves the health endpoint and the Telegram webhook receiver.
//! `run` wires the whole bot together: config validation, store, channel,
//! dispatcher, then blocks until shutdown (SIGINT/SIGTERM) or a fatal channel
//! error. Startup failures return an error so the binary exits non-zero;
//! graceful shutdown drains in-flight work and returns Ok.

use crate::channels::{ChannelError, ChannelHandle, InboundEvent, TelegramChannel, TelegramUpdate};
use crate::config::{self, Config};
use crate::dispatch::Dispatcher;
use crate::llm::GroqClient;
use crate::store::{PgStore, StateStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared state for the HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Sender for inbound events (webhook POSTs). The dispatcher task receives.
    pub inbound_tx: mpsc::Sender<InboundEvent>,
}

/// Build the HTTP router (health + webhook). Public so tests can serve it
/// without a database or bot token.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.server.port,
    }))
}

/// POST /telegram/webhook — receives Telegram update JSON; verifies the optional
/// secret, normalizes, and queues the event.
async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(ref expected) = state.config.channels.telegram.webhook_secret {
        let provided = headers
            .get("X-Telegram-Bot-Api-Secret-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let Some(event) = update.into_event() else {
        return StatusCode::OK;
    };
    if state.inbound_tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// Run the bot; binds HTTP to config.server.bind:config.server.port.
/// Blocks until shutdown. Startup errors (config, database, bot token) are fatal.
pub async fn run(config: Config) -> Result<()> {
    let secrets = config::resolve_secrets(&config)?;
    let owner = config::resolve_owner_username(&config);
    let model = config::resolve_model(&config);

    let store = PgStore::connect(&secrets.database_url, config.database.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    store
        .init_schema()
        .await
        .context("initializing database schema")?;
    let pg_version = store
        .health_check()
        .await
        .context("checking database health")?;
    log::info!("connected to {}", pg_version);

    let connections: HashMap<String, i64> = store
        .business_connections()
        .await
        .context("loading business connections")?
        .into_iter()
        .map(|c| (c.connection_id, c.owner_id))
        .collect();
    log::info!("{} business connection(s) loaded", connections.len());

    let telegram = Arc::new(TelegramChannel::new(secrets.telegram_token, None));
    let me = telegram
        .get_me()
        .await
        .context("validating telegram bot token")?;
    let who = match me.username {
        Some(ref u) => format!("@{}", u),
        None => format!("id {}", me.id),
    };
    log::info!("authenticated to telegram as {}", who);

    let backend = Arc::new(GroqClient::new(
        secrets.llm_api_key,
        config.llm.base_url.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(64);
    let (fatal_tx, fatal_rx) = mpsc::channel::<ChannelError>(1);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(store),
        telegram.clone(),
        backend,
        owner,
        model,
        connections,
    ));
    let dispatcher_handle = tokio::spawn(dispatcher.run(inbound_rx));

    let webhook_url = config.channels.telegram.webhook_url.clone();
    let listener_handle = if let Some(ref url) = webhook_url {
        let secret = config.channels.telegram.webhook_secret.as_deref();
        telegram
            .set_webhook(url, secret)
            .await
            .context("registering telegram webhook")?;
        log::info!("telegram channel registered (webhook mode): {}", url);
        None
    } else {
        let handle = telegram
            .clone()
            .start_inbound(inbound_tx.clone(), fatal_tx);
        log::info!("telegram channel registered and getUpdates loop started");
        Some(handle)
    };

    let state = AppState {
        config: Arc::new(config.clone()),
        inbound_tx,
    };
    let app = build_router(state);

    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    let tcp = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("server listening on {}", bind_addr);

    let fatal_slot: Arc<tokio::sync::Mutex<Option<ChannelError>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal(fatal_slot.clone(), fatal_rx))
        .await
        .context("server exited")?;

    // Drain: stop the poll loop, remove the webhook, let the dispatcher finish
    // the in-flight event and observe the closed queue.
    telegram.stop();
    if webhook_url.is_some() {
        if let Err(e) = telegram.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
    if let Some(handle) = listener_handle {
        let _ = handle.await;
    }
    let _ = dispatcher_handle.await;

    if let Some(e) = fatal_slot.lock().await.take() {
        return Err(e).context("telegram listener failed");
    }
    log::info!("server stopped");
    Ok(())
}

/// Future that completes when the process should shut down: SIGINT, SIGTERM, or
/// a fatal channel error (stored in `fatal_slot` so `run` can exit non-zero).
async fn shutdown_signal(
    fatal_slot: Arc<tokio::sync::Mutex<Option<ChannelError>>>,
    mut fatal_rx: mpsc::Receiver<ChannelError>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("shutdown signal received, draining");
        }
        _ = terminate => {
            log::info!("shutdown signal received, draining");
        }
        err = fatal_rx.recv() => {
            if let Some(e) = err {
                log::error!("fatal channel error, shutting down: {}", e);
                *fatal_slot.lock().await = Some(e);
            }
        }
    }
}
