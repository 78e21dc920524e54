use archive_core::search::SearchPage;
use archive_core::transcript::is_date_key;
use archive_core::{ArchiveService, LoadReport, LoadStatus, MatchMode, NotReady, Panel, SearchOptions};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

type ApiError = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn not_ready(_: NotReady) -> ApiError {
    error(StatusCode::SERVICE_UNAVAILABLE, "archive is still loading")
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub offset: usize,
    pub from: Option<String>,
    pub to: Option<String>,
}
fn default_k() -> usize { 10 }

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
}

#[derive(Serialize)]
pub struct SearchHit {
    pub date: String,
    pub score: f32,
    pub panels: Vec<PanelHit>,
}

#[derive(Serialize)]
pub struct PanelHit {
    pub panel: u32,
    pub line: usize,
    pub snippet: String,
}

#[derive(Deserialize)]
pub struct SuggestParams {
    pub prefix: String,
    #[serde(default = "default_k")]
    pub k: usize,
}

#[derive(Serialize)]
pub struct TranscriptResponse {
    pub date: String,
    pub panels: Vec<Panel>,
    pub previous: Option<String>,
    pub next: Option<String>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: LoadStatus,
    pub report: Option<LoadReport>,
}

#[derive(Clone)]
pub struct AppState {
    pub service: ArchiveService,
    pub admin_token: Option<String>,
}

/// Router with the admin token taken from `ADMIN_TOKEN`.
pub fn build_app(service: ArchiveService) -> Router {
    router(service, std::env::var("ADMIN_TOKEN").ok())
}

pub fn router(service: ArchiveService, admin_token: Option<String>) -> Router {
    let state = AppState { service, admin_token };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(status_handler))
        .route("/search", get(search_handler))
        .route("/transcript/:date", get(transcript_handler))
        .route("/suggest", get(suggest_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/admin/rebuild", post(rebuild_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse { status: state.service.status(), report: state.service.report() })
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let start = std::time::Instant::now();
    for bound in [&params.from, &params.to].into_iter().flatten() {
        if !is_date_key(bound) {
            return Err(error(StatusCode::BAD_REQUEST, format!("not a date: {bound}")));
        }
    }
    let options = SearchOptions {
        mode: params.mode,
        limit: Some(params.k.clamp(1, 100)),
        offset: params.offset,
        from: params.from,
        to: params.to,
    };
    let SearchPage { total_hits, results } = state.service.search_page(&params.q, &options).map_err(not_ready)?;

    let results = results
        .into_iter()
        .map(|r| SearchHit {
            date: r.date,
            score: r.score,
            panels: r
                .matched_panels
                .into_iter()
                .map(|m| PanelHit { panel: m.panel, line: m.line, snippet: m.excerpt.marked("<em>", "</em>") })
                .collect(),
        })
        .collect();
    Ok(Json(SearchResponse { query: params.q, took_s: start.elapsed().as_secs_f64(), total_hits, results }))
}

pub async fn transcript_handler(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let corpus = state.service.corpus().map_err(not_ready)?;
    let doc = corpus
        .store
        .get(&date)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("no strip for {date}")))?;
    Ok(Json(TranscriptResponse {
        date: doc.date.clone(),
        panels: doc.panels.clone(),
        previous: corpus.store.previous(&date).cloned(),
        next: corpus.store.next(&date).cloned(),
    }))
}

pub async fn suggest_handler(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Vec<String>>, ApiError> {
    let words = state.service.suggest(&params.prefix, params.k.clamp(1, 100)).map_err(not_ready)?;
    Ok(Json(words))
}

// --- Admin endpoints ---
async fn reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<LoadReport>, ApiError> {
    authorize(&state, &headers)?;
    match state.service.reload().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(error(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}

async fn rebuild_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<LoadReport>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.service.rebuild().await.map_err(not_ready)?))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(error(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(error(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}
