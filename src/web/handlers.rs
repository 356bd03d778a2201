use super::AppState;
use super::error::{Result, WebError};
use crate::core::{EventId, MethodInstance, Run, RunConfig, RunId, RunStatus};
use crate::engine::MethodCatalog;
use crate::export::{csv_filename, export_points_csv};
use crate::stream::{EventFeed, StreamFrame};
use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct RunSnapshot {
    #[serde(flatten)]
    pub run: Run,
    pub methods: BTreeMap<String, MethodInstance>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub since: Option<EventId>,
}

pub async fn healthcheck() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_methods(State(state): State<AppState>) -> Json<MethodCatalog> {
    Json(state.orchestrator.registry().catalog())
}

pub async fn create_run(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RunConfig>, JsonRejection>,
) -> Result<Json<CreateRunResponse>> {
    let Json(request) = payload.map_err(|rejection| WebError::Input(rejection.body_text()))?;
    let ticket = state.orchestrator.submit(request).await?;

    Ok(Json(CreateRunResponse {
        run_id: ticket.run_id(),
        status: ticket.run.status,
    }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<RunSnapshot>> {
    let run_id = parse_run_id(&raw_id)?;
    let store = state.store();
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(run_not_found)?;
    let methods = store.get_methods(run_id).await?;

    Ok(Json(RunSnapshot { run, methods }))
}

/// Server-sent events for one run. The cursor comes from `?since=`, else
/// from the `Last-Event-ID` header a reconnecting browser sends.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    query: std::result::Result<Query<EventsQuery>, QueryRejection>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    let run_id = parse_run_id(&raw_id)?;
    let Query(query) = query.map_err(|rejection| WebError::Input(rejection.body_text()))?;

    if state.store().get_run(run_id).await?.is_none() {
        return Err(run_not_found());
    }

    let since = match query.since {
        Some(since) => since,
        None => last_event_id(&headers)?.unwrap_or(0),
    };

    let feed = EventFeed::new(
        Arc::clone(state.store()),
        run_id,
        since,
        state.stream.clone(),
    );
    let frames = feed.into_stream().map(|frame| Ok(to_sse(&frame)));

    Ok(Sse::new(frames))
}

pub async fn export_csv(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response> {
    let run_id = parse_run_id(&raw_id)?;
    let body = export_points_csv(state.store().as_ref(), run_id).await?;

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", csv_filename(run_id)),
        ),
    ];
    Ok((headers, body).into_response())
}

fn to_sse(frame: &StreamFrame) -> SseEvent {
    let event = SseEvent::default()
        .event(frame.name())
        .data(frame.data().to_string());
    match frame.id() {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}

/// Malformed ids can never name a stored run.
fn parse_run_id(raw: &str) -> Result<RunId> {
    Uuid::parse_str(raw).map_err(|_| run_not_found())
}

fn run_not_found() -> WebError {
    WebError::NotFound("run not found".to_string())
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<EventId>> {
    let Some(value) = headers.get(LAST_EVENT_ID) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<EventId>().ok())
        .map(Some)
        .ok_or_else(|| WebError::Input("Last-Event-ID must be an event id".to_string()))
}
