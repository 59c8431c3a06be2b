use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use launchset_core::{avito_descriptor_set, DescriptorSet, InterpreterProfile, LaunchsetError, ProcessInfo};
use launchset_parser::load_descriptor_set;
use launchset_runner::Supervisor;
use serde::Serialize;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser)]
#[command(name = "launchsetd")]
#[command(about = "Launchset supervisor daemon", long_about = None)]
struct Args {
    /// Ecosystem file (.toml or .json); the built-in set is used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interpreter profile for the built-in set: system, venv or relative
    #[arg(short, long, default_value = "system")]
    profile: String,

    /// Venv directory (venv profile) or interpreter path (relative profile)
    #[arg(long)]
    venv: Option<PathBuf>,

    /// Working directory of the built-in set
    #[arg(long)]
    root: Option<PathBuf>,

    /// Address of the control API
    #[arg(long, default_value = "127.0.0.1:9615")]
    bind: String,
}

#[derive(Clone)]
struct AppState {
    supervisor: Supervisor,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let set = descriptor_set(&args)?;
    info!(apps = ?set.names(), "Loaded descriptor set");

    let supervisor = Supervisor::new(set);
    for process in supervisor.start_all().await {
        info!(name = %process.name, status = ?process.status, "Initial launch");
    }

    let app = router(AppState {
        supervisor: supervisor.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("Control API listening on http://{}", args.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping all processes");
    supervisor.stop_all().await;

    Ok(())
}

fn descriptor_set(args: &Args) -> anyhow::Result<DescriptorSet> {
    if let Some(config) = &args.config {
        return load_descriptor_set(config)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", config.display(), e));
    }

    let root = match &args.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let profile = InterpreterProfile::from_parts(&args.profile, args.venv.clone(), &root)?;
    Ok(avito_descriptor_set(&root, &profile)?)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/processes", get(list_processes))
        .route("/api/v1/processes/:name", get(get_process))
        .route("/api/v1/processes/:name/start", post(start_process))
        .route("/api/v1/processes/:name/stop", post(stop_process))
        .route("/api/v1/processes/:name/restart", post(restart_process))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_processes(State(state): State<AppState>) -> Json<Vec<ProcessInfo>> {
    Json(state.supervisor.list().await)
}

async fn get_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    state.supervisor.info(&name).await.map(Json).map_err(api_error)
}

async fn start_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    info!(name = %name, "Start requested");
    state.supervisor.start(&name).await.map(Json).map_err(api_error)
}

async fn stop_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    info!(name = %name, "Stop requested");
    state.supervisor.stop(&name).await.map(Json).map_err(api_error)
}

async fn restart_process(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    info!(name = %name, "Restart requested");
    state.supervisor.restart(&name).await.map(Json).map_err(api_error)
}

fn api_error(e: LaunchsetError) -> ApiError {
    let status = match e {
        LaunchsetError::ProcessNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: e.to_string() }))
}
