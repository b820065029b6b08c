//! Thin binary entry point: builds a `RuntimeConfig` from the environment,
//! wires a demo handler registry, and serves one webhook route per
//! registered adapter at `/webhooks/:adapter_name`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use clap::Parser;
use tower_http::trace::TraceLayer;

use chatkernel::{Dispatcher, HandlerRegistry, MessagePattern, RuntimeConfig};

#[derive(Parser)]
#[command(name = "chatkernel", version)]
#[command(about = "Multi-platform chat-bot event-routing kernel")]
struct Cli {
    /// Address to bind the webhook HTTP server to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Optional TOML config file overlaying ambient settings (log level, TTLs).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RuntimeConfig::from_env()?;
    if let Some(path) = &cli.config {
        config = config.apply_file_overlay(path)?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter_directive())),
        )
        .init();

    tracing::info!(adapters = ?config.adapters.keys().collect::<Vec<_>>(), "starting chatkernel");

    let registry = build_demo_registry();
    let dispatcher = Dispatcher::new(
        config.adapters,
        config.state,
        registry,
        config.dedupe_ttl,
        config.lease_ttl,
    );
    dispatcher.initialize_adapters().await?;

    let state = AppState { dispatcher };

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/{adapter_name}", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!(bind = %cli.bind, "webhook surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Routes one inbound delivery to its adapter's `handle_webhook`. The
/// `waitUntil` hook is `None` here: this binary is a conventional long-lived
/// server, not a serverless host, so dispatch runs inline and its result
/// (including `Error::Lock` on lease contention) determines the HTTP
/// response rather than being handed off to a background task.
async fn webhook(
    State(state): State<AppState>,
    Path(adapter_name): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let Some(adapter) = state.dispatcher.adapter(&adapter_name) else {
        return (StatusCode::NOT_FOUND, "unknown adapter").into_response();
    };

    let request = chatkernel::WebhookRequest {
        headers: headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect(),
        body: body.to_vec(),
    };

    match adapter.handle_webhook(request, None).await {
        Ok(response) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
            response.body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(adapter = %adapter_name, error = %err, "webhook handling failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// A demo registry wired by default: replies to mentions, echoes a `ping`
/// pattern, and subscribes to any thread a mention handler was invoked in.
/// Real deployments replace this with their own `HandlerRegistry`.
fn build_demo_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.on_new_mention(|thread, _message| async move {
        thread.post("Hi! I'm listening now — reply in this thread any time.").await?;
        thread.subscribe().await
    });

    registry.on_new_message(
        MessagePattern::regex(regex::Regex::new(r"(?i)^ping$").unwrap()),
        |thread, _message| async move {
            thread.post("pong").await?;
            Ok(())
        },
    );

    registry.on_subscribed_message(|thread, message| async move {
        tracing::debug!(thread_id = thread.id(), text = %message.text, "subscribed message received");
        Ok(())
    });

    registry
}
