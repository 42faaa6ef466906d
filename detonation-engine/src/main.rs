use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::observability::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use shared::SandboxError;

mod agent;
mod config;
mod fusion;
mod models;
mod pool;
mod scheduler;
mod services;
mod supervisor;
#[cfg(test)]
mod testkit;
mod utils;

use crate::agent::{AgentConnector, TcpAgentConnector};
use crate::config::Config;
use crate::fusion::FusionEngine;
use crate::models::machine::MachineStatus;
use crate::models::task::{FileType, SubmitTaskRequest, TaskPriority, TaskResponse};
use crate::pool::{MachinePool, PoolStats};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::services::capture::TcpdumpCapture;
use crate::services::hypervisor::ShellHypervisor;
use crate::services::intel::{HttpIntelClient, NullIntelClient};
use crate::services::{CaptureClient, FuzzyHashClient, HypervisorClient, ReportStoreClient, SignatureClient};
use crate::supervisor::SupervisorContext;
use crate::utils::SampleSpool;

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Scheduler>,
    pool: Arc<MachinePool>,
    spool: Arc<SampleSpool>,
}

#[derive(Debug, Default, Deserialize)]
struct SubmitTaskMeta {
    platform: Option<String>,
    priority: Option<String>,
    max_run_seconds: Option<u64>,
    file_type: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    task_id: String,
    status: String,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    pool: PoolStats,
}

#[derive(Serialize)]
struct StatsResponse {
    scheduler: SchedulerStats,
    pool: PoolStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    config.validate()?;

    init_logging(LogConfig {
        level: LogLevel::parse(&config.logging.level),
        format: LogFormat::parse(&config.logging.format),
        service_name: "detonation-engine".to_string(),
        ..Default::default()
    })?;

    info!("Starting detonation engine");

    let spool = Arc::new(SampleSpool::new(&config.storage.spool_dir)?);

    let hypervisor: Arc<dyn HypervisorClient> =
        Arc::new(ShellHypervisor::new(config.pool.hypervisor_bin.clone()));
    let capture: Arc<dyn CaptureClient> = Arc::new(TcpdumpCapture::new(
        config.capture.binary.clone(),
        config.capture.output_dir.clone(),
    )?);

    let pool = Arc::new(MachinePool::new(config.pool.clone(), Arc::clone(&hypervisor)));
    info!(machines = config.pool.machines.len(), "Bringing machine pool online");
    pool.start_all().await;

    let (signatures, fuzzy): (Arc<dyn SignatureClient>, Arc<dyn FuzzyHashClient>) =
        match &config.intel.endpoint {
            Some(endpoint) => {
                let client = Arc::new(HttpIntelClient::new(
                    endpoint.clone(),
                    config.intel.request_timeout(),
                )?);
                (
                    Arc::clone(&client) as Arc<dyn SignatureClient>,
                    client as Arc<dyn FuzzyHashClient>,
                )
            }
            None => {
                warn!("INTEL_ENDPOINT not set, signature and fuzzy-hash lookups degrade to empty");
                (Arc::new(NullIntelClient), Arc::new(NullIntelClient))
            }
        };

    let fusion = Arc::new(FusionEngine::new(config.fusion.clone(), signatures, fuzzy));
    let store = ReportStoreClient::new(
        config.store.endpoint.clone(),
        config.store.max_attempts,
        config.store.retry_delay(),
    );

    let connector: Arc<dyn AgentConnector> = Arc::new(TcpAgentConnector::new(
        config.agent.port,
        config.agent.call_timeout(),
        config.agent.call_timeout(),
    ));

    let supervisor_ctx = SupervisorContext {
        connector,
        capture,
        hypervisor,
        config: config.supervisor.clone(),
        agent_config: config.agent.clone(),
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&pool),
        supervisor_ctx,
        fusion,
        store,
    ));
    Arc::clone(&scheduler).start();

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        pool,
        spool,
    };

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task).delete(cancel_task))
        .route("/machines", get(list_machines))
        .route("/machines/:id/recover", post(recover_machine))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if config.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Detonation engine listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    Ok(())
}

async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    scheduler.shutdown().await;
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "detonation-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pool: state.pool.stats().await,
    })
}

async fn submit_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, StatusCode> {
    info!("Received sample submission");

    let mut file_data = Vec::new();
    let mut filename: Option<String> = None;
    let mut meta = SubmitTaskMeta::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error!("Failed to read multipart field: {}", e);
        StatusCode::BAD_REQUEST
    })? {
        let name = field.name().map(|s| s.to_string()).unwrap_or_default();
        if name == "file" {
            filename = field.file_name().map(|s| s.to_string());
            file_data = field
                .bytes()
                .await
                .map_err(|e| {
                    error!("Failed to read sample bytes: {}", e);
                    StatusCode::BAD_REQUEST
                })?
                .to_vec();
        } else if name == "request" {
            let json_str = field.text().await.map_err(|e| {
                error!("Failed to read request json: {}", e);
                StatusCode::BAD_REQUEST
            })?;
            meta = serde_json::from_str(&json_str).map_err(|e| {
                error!("Invalid request json: {}", e);
                StatusCode::BAD_REQUEST
            })?;
        }
    }

    if file_data.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let sample = state
        .spool
        .save(&file_data, filename.clone())
        .await
        .map_err(|e| {
            error!("Failed to spool sample: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let request = SubmitTaskRequest {
        sample,
        platform: meta.platform.unwrap_or_default(),
        file_type: FileType::from_hint(meta.file_type.as_deref(), filename.as_deref()),
        priority: parse_priority(meta.priority.as_deref()),
        max_run_duration: meta.max_run_seconds.map(Duration::from_secs),
    };

    match state.scheduler.submit(request).await {
        Ok(task_id) => Ok(Json(SubmitResponse {
            task_id: task_id.to_string(),
            status: "pending".to_string(),
            message: "Task queued for detonation".to_string(),
        })),
        Err(SandboxError::InvalidTask(msg)) => {
            warn!("Submission rejected: {}", msg);
            Err(StatusCode::BAD_REQUEST)
        }
        Err(e) => {
            error!("Submission failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn parse_priority(raw: Option<&str>) -> TaskPriority {
    match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("low") => TaskPriority::Low,
        Some("high") => TaskPriority::High,
        Some("critical") => TaskPriority::Critical,
        _ => TaskPriority::Normal,
    }
}

async fn get_task(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TaskResponse>, StatusCode> {
    match state.scheduler.task_status(id).await {
        Some(status) => Ok(Json(status)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn cancel_task(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, StatusCode> {
    match state.scheduler.cancel(id).await {
        Ok(()) => Ok(StatusCode::ACCEPTED),
        Err(SandboxError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(SandboxError::InvalidTask(msg)) => {
            warn!("Cancel rejected: {}", msg);
            Err(StatusCode::CONFLICT)
        }
        Err(e) => {
            error!("Cancel failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_machines(State(state): State<AppState>) -> Json<Vec<MachineStatus>> {
    Json(state.pool.status().await)
}

/// External health-check hook: clear a cordoned machine back into rotation
async fn recover_machine(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<StatusCode, StatusCode> {
    match state.pool.clear_cordon(&id).await {
        Ok(()) => Ok(StatusCode::OK),
        Err(SandboxError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(SandboxError::Internal(msg)) => {
            warn!("Recover rejected: {}", msg);
            Err(StatusCode::CONFLICT)
        }
        Err(e) => {
            error!("Machine recovery failed: {}", e);
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        scheduler: state.scheduler.stats().await,
        pool: state.pool.stats().await,
    })
}
