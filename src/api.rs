// src/api.rs
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use tower_http::cors::CorsLayer;

use crate::ingest::engine::{is_not_found, Engine};
use crate::ingest::scheduler::RefreshScheduler;
use crate::ingest::types::{FeedSnapshot, Item, LastUpdated};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
    scheduler: Option<Arc<RefreshScheduler>>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, scheduler: Option<Arc<RefreshScheduler>>) -> Self {
        Self { engine, scheduler }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/feed", get(get_feed))
        .route("/api/refresh", post(refresh))
        .route("/api/status", get(status))
        .route("/api/read", post(mark_read))
        .route("/api/unread", post(mark_unread))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorOut>);

#[derive(serde::Serialize)]
pub struct ErrorOut {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorOut { error: msg.into() }))
}

#[derive(serde::Deserialize)]
struct FeedQuery {
    url: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemOut {
    #[serde(flatten)]
    item: Item,
    read: bool,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedOut {
    title: String,
    link: String,
    icon: String,
    last_updated: LastUpdated,
    filtered_count: usize,
    items: Vec<ItemOut>,
}

impl FeedOut {
    fn from_snapshot(snap: &FeedSnapshot, is_read: impl Fn(&str) -> bool) -> Self {
        Self {
            title: snap.title.clone(),
            link: snap.link.clone(),
            icon: snap.icon.clone(),
            last_updated: snap.last_updated,
            filtered_count: snap.filtered_count,
            items: snap
                .items
                .iter()
                .map(|it| ItemOut {
                    read: is_read(&it.link),
                    item: it.clone(),
                })
                .collect(),
        }
    }
}

async fn get_feed(
    State(state): State<AppState>,
    Query(q): Query<FeedQuery>,
) -> Result<Json<FeedOut>, ApiError> {
    let snap = state
        .engine
        .snapshot(&q.url)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("feed not found: {}", q.url)))?;
    let caches = state.engine.caches();
    Ok(Json(FeedOut::from_snapshot(&snap, |link| caches.is_read(link))))
}

#[derive(serde::Deserialize)]
struct RefreshReq {
    target: String,
    #[serde(default)]
    force: bool,
}

#[derive(serde::Serialize)]
struct RefreshOut {
    requested: usize,
    failed: usize,
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshReq>,
) -> Result<Json<RefreshOut>, ApiError> {
    match state.engine.refresh(&body.target, body.force).await {
        Ok(report) => Ok(Json(RefreshOut {
            requested: report.requested,
            failed: report.failed,
        })),
        Err(e) if is_not_found(&e) => Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            let msg = format!("{e:#}");
            tracing::warn!(target: "update", target_id = %body.target, error = %msg, "manual refresh failed");
            Err(api_error(StatusCode::BAD_GATEWAY, msg))
        }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusOut {
    next_update: Option<DateTime<Utc>>,
    sources: usize,
    snapshots: usize,
    pending_flush: bool,
}

async fn status(State(state): State<AppState>) -> Json<StatusOut> {
    let engine = &state.engine;
    Json(StatusOut {
        next_update: state.scheduler.as_ref().and_then(|s| s.next_global_update()),
        sources: engine.config().current().sources.len(),
        snapshots: engine.snapshots().len(),
        pending_flush: engine.caches().is_dirty(),
    })
}

#[derive(serde::Deserialize)]
struct LinksReq {
    links: Vec<String>,
}

#[derive(serde::Serialize)]
struct CountOut {
    count: usize,
}

async fn mark_read(State(state): State<AppState>, Json(body): Json<LinksReq>) -> Json<CountOut> {
    let count = state.engine.caches().mark_read_batch(&body.links);
    Json(CountOut { count })
}

async fn mark_unread(State(state): State<AppState>, Json(body): Json<LinksReq>) -> Json<CountOut> {
    let caches = state.engine.caches();
    let count = body.links.iter().filter(|l| caches.mark_unread(l)).count();
    Json(CountOut { count })
}
