//! DevTeam Server
//!
//! Command line entry point and HTTP surface over the pipeline orchestrator.
//! One run executes at a time; the HTTP API rejects triggers while a run is
//! active.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use devteam_core::{
    DevTeamConfig, Orchestrator, ProviderKind, RunOutcome, RunStore, StoreError, TriggerPayload,
};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};
use tracing_subscriber::EnvFilter;
use utoipa::{OpenApi, ToSchema};

#[derive(Parser, Clone)]
#[command(author, version, about = "devteam - Virtual dev team pipeline")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Run the pipeline once for a request
    Run {
        /// What to build
        request: String,
        /// Who asked
        #[arg(long)]
        from: Option<String>,
        /// Channel the request came from
        #[arg(long)]
        channel: Option<String>,
        /// AI backend: api, codex or offline
        #[arg(long, value_parser = parse_provider)]
        provider: Option<ProviderKind>,
    },
    /// Print the current (or given) run state
    Status {
        #[arg(long)]
        run: Option<String>,
    },
    /// Print the last pipeline events
    Events {
        #[arg(long, default_value = "20")]
        tail: usize,
    },
    /// Print the resolved configuration
    Config,
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

fn parse_provider(value: &str) -> Result<ProviderKind, String> {
    ProviderKind::parse(value).ok_or_else(|| format!("unknown provider `{value}` (api, codex, offline)"))
}

/// Application state
struct AppState {
    orchestrator: Orchestrator,
    /// Id of the run in flight, if any
    active: Mutex<Option<String>>,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    request: String,
    requester: Option<String>,
    channel_id: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct TriggerResponse {
    run_id: String,
    status: String,
}

#[derive(Serialize, ToSchema)]
struct ApiResponse {
    success: bool,
    message: String,
}

#[derive(Deserialize, ToSchema)]
struct EventsQuery {
    tail: Option<usize>,
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse {
        success: status.is_success(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

fn store_failure(e: StoreError) -> Response {
    match e {
        StoreError::NotFound(id) => reply(StatusCode::NOT_FOUND, format!("no run `{id}`")),
        other => {
            tracing::error!(error = %other, "Run store read failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn valid_run_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "DevTeam API",
        version = "1.0.0",
        description = "Trigger and inspect virtual dev team pipeline runs"
    ),
    paths(trigger_run, current_run, get_run, list_events),
    components(schemas(TriggerRequest, TriggerResponse, ApiResponse, EventsQuery)),
    tags(
        (name = "runs", description = "Pipeline runs"),
        (name = "events", description = "Pipeline event log")
    )
)]
struct ApiDoc;

// === API Handlers ===

/// Start a run in the background
#[utoipa::path(
    post,
    path = "/api/v1/runs",
    tag = "runs",
    request_body = TriggerRequest,
    responses(
        (status = 202, description = "Run accepted", body = TriggerResponse),
        (status = 400, description = "Empty request", body = ApiResponse),
        (status = 409, description = "A run is already active", body = ApiResponse)
    )
)]
async fn trigger_run(State(state): State<SharedState>, Json(req): Json<TriggerRequest>) -> Response {
    if req.request.trim().is_empty() {
        return reply(StatusCode::BAD_REQUEST, "request must not be empty");
    }

    let run_id = {
        let mut active = state.active.lock().await;
        if let Some(current) = active.as_ref() {
            return reply(StatusCode::CONFLICT, format!("run `{current}` is still active"));
        }
        let run_id = devteam_core::orchestrator::new_run_id();
        *active = Some(run_id.clone());
        run_id
    };

    let trigger = TriggerPayload {
        request: req.request,
        requester: req.requester,
        channel_id: req.channel_id,
        timestamp: Some(chrono::Utc::now()),
    };
    let task_state = state.clone();
    let id = run_id.clone();
    supervise_run(state.clone(), async move {
        let outcome = task_state.orchestrator.run_with_id(id, trigger).await;
        tracing::info!(run_id = %outcome.run_id, success = outcome.success, "Run finished");
    });

    let body = TriggerResponse {
        run_id,
        status: "accepted".to_string(),
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// Run `work` on its own task and free the run slot however it ends,
/// panics included.
fn supervise_run<F>(state: SharedState, work: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(work).await {
            tracing::error!(error = %e, "Run task aborted");
        }
        *state.active.lock().await = None;
    })
}

/// State of the most recent run
#[utoipa::path(
    get,
    path = "/api/v1/runs/current",
    tag = "runs",
    responses(
        (status = 200, description = "Run state"),
        (status = 404, description = "No run recorded", body = ApiResponse)
    )
)]
async fn current_run(State(state): State<SharedState>) -> Response {
    match state.orchestrator.store().load_current().await {
        Ok(run) => Json(run).into_response(),
        Err(e) => store_failure(e),
    }
}

/// State of one run
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}",
    tag = "runs",
    params(("id" = String, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run state"),
        (status = 400, description = "Malformed run id", body = ApiResponse),
        (status = 404, description = "Unknown run", body = ApiResponse)
    )
)]
async fn get_run(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    if !valid_run_id(&id) {
        return reply(StatusCode::BAD_REQUEST, "malformed run id");
    }
    match state.orchestrator.store().load_state(&id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => store_failure(e),
    }
}

/// Tail of the pipeline event log
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "events",
    params(("tail" = Option<usize>, Query, description = "Number of most recent events")),
    responses((status = 200, description = "Pipeline events, oldest first"))
)]
async fn list_events(State(state): State<SharedState>, Query(query): Query<EventsQuery>) -> Response {
    match state.orchestrator.store().read_events(query.tail).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => store_failure(e),
    }
}

async fn serve_openapi() -> Response {
    match ApiDoc::openapi().to_json() {
        Ok(spec) => ([(header::CONTENT_TYPE, "application/json")], spec).into_response(),
        Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/runs", post(trigger_run))
        .route("/api/v1/runs/current", get(current_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .with_state(state)
}

async fn run_server(config: DevTeamConfig, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::from_config(config, None),
        active: Mutex::new(None),
    });
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "DevTeam server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn print_status(store: &RunStore, run: Option<String>) -> anyhow::Result<()> {
    let state = match run {
        Some(id) => store.load_state(&id).await,
        None => store.load_current().await,
    }
    .context("no run state to show")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

/// Load `.env` from the working directory, then from the workspace, and
/// resolve the configuration with both applied.
async fn load_config() -> DevTeamConfig {
    let _ = dotenvy::dotenv();
    let config = DevTeamConfig::load().await;
    match dotenvy::from_path(config.workspace.join(".env")) {
        Ok(()) => DevTeamConfig::load().await,
        Err(_) => config,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config().await;
    init_tracing();

    match args.command {
        CliCommand::Run {
            request,
            from,
            channel,
            provider,
        } => {
            let orchestrator = Orchestrator::from_config(config, provider);
            let trigger = TriggerPayload {
                request,
                requester: from,
                channel_id: channel,
                timestamp: Some(chrono::Utc::now()),
            };
            let outcome = orchestrator.run(trigger).await;
            print_outcome(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        CliCommand::Status { run } => {
            print_status(&RunStore::new(config.workspace.clone()), run).await?;
        }
        CliCommand::Events { tail } => {
            let events = RunStore::new(config.workspace.clone())
                .read_events(Some(tail))
                .await
                .context("failed to read the event log")?;
            for event in events {
                println!("{}", event.to_line());
            }
        }
        CliCommand::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        CliCommand::Serve { port } => run_server(config, port).await?,
    }
    Ok(())
}
