use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use magpie_types::Report;

use crate::error::ApiError;
use crate::render;
use crate::ws::ws_handler;
use crate::AppState;

const API_PREFIX: &str = "/api/v1";

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/research", post(submit_research).get(list_research))
        .route("/research/{id}", get(get_research))
        .route("/research/{id}/progress", get(get_progress))
        .route("/research/{id}/cancel", post(cancel_research))
        .route("/research/{id}/retry", post(retry_research))
        .route("/reports/{id}", get(get_report))
        .route("/reports/session/{sid}", get(get_report_by_session))
        .route("/reports/{id}/download", get(download_report))
        .route("/reports/{id}/sources", get(get_report_sources))
        .route("/reports/{id}/citations", get(get_report_citations))
        .route("/search", post(search))
        .route("/search/history", get(search_history))
        .route("/settings/user", get(get_user_settings).put(put_user_settings))
        .route("/settings/models", get(get_models))
        .route("/settings/search-engines", get(get_search_engines))
        .route("/ws", get(ws_handler));

    Router::new()
        .route("/health", get(health))
        .nest(API_PREFIX, api)
        .layer(cors)
        .with_state(state)
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({"success": true, "data": data}))
}

/// Identity is a collaborator concern (the auth layer sits in front of this
/// service); requests arrive with the resolved user id in a header.
fn user_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "env": state.services.config.env,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ----- research sessions -----

#[derive(Debug, Deserialize)]
struct SubmitBody {
    topic: String,
    #[serde(default)]
    parameters: Option<magpie_types::ResearchParameters>,
}

async fn submit_research(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let receipt = state
        .session_service
        .submit(&user, &body.topic, body.parameters.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, ok(serde_json::to_value(receipt).unwrap_or_default()))
        .into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

async fn list_research(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let (sessions, total) = state
        .session_service
        .list(&user, query.status.as_deref(), query.page, query.limit)
        .await?;
    Ok(ok(json!({
        "sessions": sessions,
        "total": total,
        "page": query.page,
        "limit": query.limit.clamp(1, 100),
    })))
}

async fn get_research(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let session = state.session_service.get(&id, &user).await?;
    Ok(ok(serde_json::to_value(session).unwrap_or_default()))
}

async fn get_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let progress = state.session_service.progress(&id, &user).await?;
    Ok(ok(serde_json::to_value(progress).unwrap_or_default()))
}

async fn cancel_research(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let status = state.session_service.cancel(&id, &user).await?;
    Ok(ok(json!({"session_id": id, "status": status})))
}

async fn retry_research(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let receipt = state.session_service.retry(&id, &user).await?;
    Ok((StatusCode::CREATED, ok(serde_json::to_value(receipt).unwrap_or_default()))
        .into_response())
}

// ----- reports -----

#[derive(Debug, Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

async fn load_report_scoped(
    state: &AppState,
    report_id: &str,
    user: &str,
) -> Result<Report, ApiError> {
    let report = state
        .services
        .store
        .get_report(report_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("report {report_id}")))?;
    // ownership check rides on the owning session
    state.session_service.get(&report.session_id, user).await?;
    Ok(report)
}

async fn get_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let report = load_report_scoped(&state, &id, &user).await?;
    let format = query.format.as_deref().unwrap_or("json");
    if format == "json" {
        return Ok(ok(render::report_json(&report)).into_response());
    }
    let (content_type, body) = render::report_as(&report, format);
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn get_report_by_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(sid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    // scope first so a foreign session id reads as not-found
    state.session_service.get(&sid, &user).await?;
    let report = state
        .services
        .store
        .get_report_by_session(&sid)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("report for session {sid}")))?;
    Ok(ok(render::report_json(&report)))
}

async fn download_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers)?;
    let report = load_report_scoped(&state, &id, &user).await?;
    let format = query.format.as_deref().unwrap_or("markdown");
    let (content_type, body) = render::report_as(&report, format);
    let filename = format!(
        "research-report-{}.{}",
        report.id,
        render::download_extension(format)
    );
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

async fn get_report_sources(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let report = load_report_scoped(&state, &id, &user).await?;
    let sources = state.services.store.list_sources(&report.session_id).await?;
    Ok(ok(json!({"count": sources.len(), "sources": sources})))
}

async fn get_report_citations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let report = load_report_scoped(&state, &id, &user).await?;
    let citations = state.services.store.list_citations(&report.id).await?;
    Ok(ok(json!({"count": citations.len(), "citations": citations})))
}

// ----- search -----

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default = "default_search_results")]
    max_results: usize,
    language: Option<String>,
    time_range: Option<String>,
}

fn default_search_results() -> usize {
    10
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let hits = state
        .session_service
        .search(
            &user,
            &body.query,
            body.max_results,
            body.language,
            body.time_range,
        )
        .await?;
    Ok(ok(json!({"count": hits.len(), "results": hits})))
}

async fn search_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let history = state.session_service.search_history(&user).await?;
    Ok(ok(history))
}

// ----- settings -----

async fn get_user_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    let settings = state
        .services
        .store
        .get_user_settings(&user)
        .await?
        .unwrap_or_else(|| json!({}));
    Ok(ok(settings))
}

async fn put_user_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(preferences): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let user = user_id(&headers)?;
    if !preferences.is_object() {
        return Err(ApiError::Validation(
            "preferences must be a JSON object".to_string(),
        ));
    }
    state
        .services
        .store
        .put_user_settings(&user, &preferences)
        .await?;
    Ok(ok(preferences))
}

async fn get_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "default_model": state.services.config.llm_default_model,
            "base_url": state.services.config.llm_base_url,
        }
    }))
}

async fn get_search_engines(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "endpoint": state.services.config.searx_endpoint,
            "kind": "searxng",
        }
    }))
}
