//! clabd server
//!
//! The main entry point. Probes host sandbox capabilities once at startup,
//! locks in an isolation tier, then serves the batch compile endpoint and
//! the interactive WebSocket terminal.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clabd::config::Config;
use clabd::critique::{CodeCritic, HttpCritic};
use clabd::hub::{serve_connection, Hub, Identity, Role, SessionDeps};
use clabd::pipeline::{compile_and_run, CompileRequest, CompileResponse};
use clabd::sandbox::{
    select_tier_or_prompt, CapabilitySet, OverridePrompt, SandboxPolicy,
};
use clabd::storage::{NoopStore, RunStore};
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// ---- CLI ----

#[derive(Parser)]
#[command(name = "clabd-server", about = "Secure C compile-and-run service")]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port
    #[arg(long, short, default_value = "8080")]
    port: u16,

    /// Path to a config file (TOML/JSON); env vars override it
    #[arg(long)]
    config: Option<PathBuf>,
}

// ---- App State ----

#[derive(Clone)]
struct AppState {
    deps: SessionDeps,
}

// ---- Operator override ----

/// Interactive confirmation for running without any sandbox. Only
/// consulted when no isolation mechanism is available; a non-interactive
/// terminal refuses.
struct TerminalPrompt;

impl OverridePrompt for TerminalPrompt {
    fn confirm_unsandboxed(&self) -> bool {
        use std::io::IsTerminal;
        if !std::io::stdin().is_terminal() {
            return false;
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(
                "No sandbox mechanism found. Run submissions UNSANDBOXED on this host?",
            )
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

// ---- Handlers ----

/// Identity fields carried on the WebSocket URL. Authentication itself is
/// handled upstream; anonymous connections get no persistence.
#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "dbId")]
    db_id: Option<i64>,
    role: Option<String>,
    name: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = match params.user_id {
        Some(user_id) => Identity {
            name: params.name.unwrap_or_else(|| user_id.clone()),
            user_id,
            db_id: params.db_id,
            role: params
                .role
                .and_then(|r| r.parse::<Role>().ok())
                .unwrap_or(Role::Student),
        },
        None => Identity::anonymous(),
    };
    info!(user_id = %identity.user_id, role = ?identity.role, "WebSocket connecting");

    ws.on_upgrade(move |socket| serve_connection(socket, identity, state.deps))
}

async fn compile_handler(
    State(state): State<AppState>,
    Json(request): Json<CompileRequest>,
) -> Json<CompileResponse> {
    let response = compile_and_run(
        &state.deps.policy,
        state.deps.critic.as_ref(),
        &request,
    )
    .await;
    Json(response)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "name": clabd::NAME,
        "version": clabd::VERSION,
        "tier": state.deps.policy.tier.to_string(),
        "monitors": state.deps.hub.monitor_count().await,
    }))
}

// ---- Router ----

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/compile", post(compile_handler))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// ---- Main ----

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // Security posture is fixed for the life of the process.
    let caps = CapabilitySet::probe();
    let tier = select_tier_or_prompt(&caps, &TerminalPrompt)?;
    let policy = SandboxPolicy::new(tier, caps, config.sandbox.clone());
    info!("Sandbox policy: {}", policy.report());

    let critic: Arc<dyn CodeCritic> = Arc::new(HttpCritic::new(&config.critique)?);
    // Persistence lives behind RunStore; swap in a real backend here.
    let store: Arc<dyn RunStore> = Arc::new(NoopStore);
    warn!("Run records are not persisted (no storage backend configured)");

    let state = AppState {
        deps: SessionDeps {
            hub: Hub::spawn(),
            policy: Arc::new(policy),
            critic,
            store,
            config: config.session.clone(),
        },
    };

    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!("clabd listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
