use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use phonetrack_core::evaluator::TrackerEntity;
use phonetrack_core::tracker::Tracker;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Trackers that finished setup, in the order they came up. Trackers still
/// retrying setup are appended once ready.
pub type SharedTrackers = Arc<RwLock<Vec<Tracker>>>;

#[derive(Clone)]
struct HttpState {
    trackers: SharedTrackers,
}

#[derive(Serialize)]
struct RefreshStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    entity: TrackerEntity,
}

pub fn router(trackers: SharedTrackers) -> Router {
    Router::new()
        .route("/api/trackers", get(list_trackers))
        .route("/api/trackers/:idx", get(get_tracker))
        .route("/api/trackers/:idx/refresh", post(refresh_tracker))
        .with_state(HttpState { trackers })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    trackers: SharedTrackers,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("[http] failed to bind {}: {}", addr, e);
                return;
            }
        };

        info!("[http] API listening on http://{}", addr);
        serve(listener, trackers, shutdown).await;
    })
}

/// Serve until `shutdown` fires and every open connection has closed.
pub async fn serve(listener: TcpListener, trackers: SharedTrackers, shutdown: CancellationToken) {
    let app = router(trackers);
    let signal = async move { shutdown.cancelled().await };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
        error!("[http] server error: {}", e);
    }
    info!("[http] API stopped");
}

async fn list_trackers(State(state): State<HttpState>) -> Json<Vec<TrackerEntity>> {
    let now = Utc::now();
    let trackers = state.trackers.read().await;
    let mut entities = Vec::with_capacity(trackers.len());
    for tracker in trackers.iter() {
        entities.push(tracker.entity(now).await);
    }
    Json(entities)
}

async fn get_tracker(
    State(state): State<HttpState>,
    Path(idx): Path<usize>,
) -> Result<Json<TrackerEntity>, StatusCode> {
    let trackers = state.trackers.read().await;
    let tracker = trackers.get(idx).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(tracker.entity(Utc::now()).await))
}

async fn refresh_tracker(
    State(state): State<HttpState>,
    Path(idx): Path<usize>,
) -> Result<(StatusCode, Json<RefreshStatus>), StatusCode> {
    let trackers = state.trackers.read().await;
    let tracker = trackers.get(idx).ok_or(StatusCode::NOT_FOUND)?;
    info!("[http] refresh requested for tracker {}", idx);

    let outcome = tracker.request_refresh().await;
    let entity = tracker.entity(Utc::now()).await;
    let reply = match outcome {
        Ok(()) => (
            StatusCode::OK,
            Json(RefreshStatus {
                ok: true,
                error: None,
                entity,
            }),
        ),
        Err(e) => {
            debug!("[http] refresh of tracker {} failed: {}", idx, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(RefreshStatus {
                    ok: false,
                    error: Some(e.to_string()),
                    entity,
                }),
            )
        }
    };
    Ok(reply)
}
