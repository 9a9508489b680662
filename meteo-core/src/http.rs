//! HTTP surface: trigger a fetch, read the latest sample.
//!
//! Unauthenticated; bind it to a trusted interface.

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    config::{DefaultLocation, FetchMode},
    error::{FetchError, StoreError},
    model::{FetchJob, SampleView},
    pipeline::FetchPipeline,
    queue::JobQueue,
};

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub pipeline: FetchPipeline,
    pub queue: Arc<dyn JobQueue>,
    pub fetch_mode: FetchMode,
    pub defaults: DefaultLocation,
}

/// `{"detail": ...}` error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

#[derive(Debug, Serialize)]
struct Detail<'a> {
    detail: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(Detail { detail: &self.detail })).into_response()
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        let status = match &e {
            FetchError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FetchError::StoreWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FetchError::UpstreamHttp { .. }
            | FetchError::Transport(_)
            | FetchError::MalformedResponse(_)
            | FetchError::InvalidTimestamp { .. } => StatusCode::BAD_GATEWAY,
        };
        warn!(%status, "fetch failed: {e}");
        ApiError::new(status, e.to_string())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("store error: {e}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Storage unavailable")
    }
}

/// Raw query of `GET /weather/fetch/`. Numbers are parsed by hand so a bad
/// value yields our own 400 body.
#[derive(Debug, Default, Deserialize)]
pub struct FetchParams {
    pub city: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchScheduled {
    pub detail: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

fn parse_coordinate(name: &str, raw: Option<&str>, default: f64) -> Result<f64, ApiError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid '{name}' parameter: '{raw}' is not a number"),
        )),
    }
}

impl FetchParams {
    fn resolve(&self, defaults: &DefaultLocation) -> Result<FetchJob, ApiError> {
        Ok(FetchJob {
            city: self.city.clone().unwrap_or_else(|| defaults.city.clone()),
            latitude: parse_coordinate("lat", self.lat.as_deref(), defaults.latitude)?,
            longitude: parse_coordinate("lon", self.lon.as_deref(), defaults.longitude)?,
        })
    }
}

async fn fetch_handler(
    State(state): State<AppState>,
    params: Result<Query<FetchParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let job = params.resolve(&state.defaults)?;

    match state.fetch_mode {
        FetchMode::Deferred => {
            let body = FetchScheduled {
                detail: "Fetch scheduled".to_string(),
                city: job.city.clone(),
                lat: job.latitude,
                lon: job.longitude,
            };
            state.queue.enqueue_fetch(job).await.map_err(|e| {
                error!("enqueue failed: {e}");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "Could not schedule fetch")
            })?;
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        FetchMode::Inline => {
            let sample = state.pipeline.run(&job.city, job.latitude, job.longitude).await?;
            Ok(Json(SampleView::from(&sample)).into_response())
        }
    }
}

async fn latest_handler(State(state): State<AppState>) -> Result<Json<SampleView>, ApiError> {
    match state.pipeline.store().latest().await? {
        Some(sample) => Ok(Json(SampleView::from(&sample))),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "No samples yet")),
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<Health> {
    Json(Health { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/weather/fetch/", get(fetch_handler))
        .route("/weather/latest/", get(latest_handler))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP server listening on {addr}");
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}
