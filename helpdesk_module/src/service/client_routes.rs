use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::clients::{
    ClientNote, ClientRecord, ClientStoreError, MergeError, MergeRecord, MergeStrategy,
    MergeSummary, NewClientRecord,
};

use super::errors::ApiError;
use super::state::AppState;

pub(super) fn client_router() -> Router<AppState> {
    Router::new()
        .route("/clients", get(find_clients).post(create_client))
        .route("/clients/:id", get(get_client))
        .route("/clients/:id/notes", get(list_notes).post(add_note))
        .route("/clients/:id/tags", post(add_tag))
        .route("/clients/:id/merge", post(merge_clients))
        .route("/clients/:id/merges", get(merge_history))
}

#[derive(Debug, Deserialize)]
struct ClientLookup {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoteRequest {
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagRequest {
    #[serde(default)]
    tag: String,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    #[serde(default)]
    client_ids: Vec<i64>,
    #[serde(default)]
    strategy: Option<String>,
}

/// Malformed or missing bodies answer with the validation shape, not axum's
/// plain-text rejection.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::validation("body", rejection.body_text()))
}

fn client_not_found(id: i64) -> ApiError {
    ApiError::not_found("client_not_found", format!("Client {} not found.", id))
}

fn client_error(state: &AppState, err: ClientStoreError) -> ApiError {
    match err {
        ClientStoreError::Validation { field, message } => ApiError::validation(field, message),
        ClientStoreError::NotFound(id) => client_not_found(id),
        ClientStoreError::Merge(err) => ApiError::validation(err.field(), err.to_string()),
        other => state.internal(other),
    }
}

async fn create_client(
    State(state): State<AppState>,
    payload: Result<Json<NewClientRecord>, JsonRejection>,
) -> Result<(StatusCode, Json<ClientRecord>), ApiError> {
    let request = json_body(payload)?;
    let store = state.clients.clone();
    let created = state
        .blocking(move || store.create_client(&request))
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn find_clients(
    State(state): State<AppState>,
    Query(lookup): Query<ClientLookup>,
) -> Result<Json<Vec<ClientRecord>>, ApiError> {
    let email = lookup
        .email
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::validation("email", "The email field is required."))?;
    let store = state.clients.clone();
    let found = state
        .blocking(move || store.find_by_email(&email))
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok(Json(found.into_iter().collect()))
}

async fn get_client(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ClientRecord>, ApiError> {
    let store = state.clients.clone();
    let client = state
        .blocking(move || store.get_client(id))
        .await?
        .map_err(|err| client_error(&state, err))?;
    client.map(Json).ok_or_else(|| client_not_found(id))
}

async fn list_notes(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<ClientNote>>, ApiError> {
    let store = state.clients.clone();
    let notes = state
        .blocking(move || -> Result<_, ClientStoreError> {
            if store.get_client(id)?.is_none() {
                return Err(ClientStoreError::NotFound(id));
            }
            store.list_notes(id)
        })
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok(Json(notes))
}

async fn add_note(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<NoteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ClientNote>), ApiError> {
    let request = json_body(payload)?;
    let store = state.clients.clone();
    let note = state
        .blocking(move || store.add_note(id, &request.body, request.author.as_deref()))
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn add_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<TagRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request = json_body(payload)?;
    let store = state.clients.clone();
    let tags = state
        .blocking(move || store.add_tag(id, &request.tag))
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok(Json(json!({ "client_id": id, "tags": tags })))
}

async fn merge_clients(
    State(state): State<AppState>,
    Path(primary_id): Path<i64>,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<MergeSummary>, ApiError> {
    let request = json_body(payload)?;
    let strategy = match request.strategy.as_deref().map(str::trim) {
        None | Some("") => MergeStrategy::default(),
        Some(raw) => raw
            .parse::<MergeStrategy>()
            .map_err(|_| ApiError::validation("strategy", "The selected strategy is invalid."))?,
    };
    let store = state.clients.clone();
    let client_ids = request.client_ids;
    let result = state
        .blocking(move || store.merge_clients(primary_id, &client_ids, strategy))
        .await?;
    match result {
        Ok(summary) => Ok(Json(summary)),
        Err(ClientStoreError::Merge(MergeError::UnknownClient(id))) if id == primary_id => {
            Err(client_not_found(id))
        }
        Err(err) => Err(client_error(&state, err)),
    }
}

async fn merge_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<MergeRecord>>, ApiError> {
    let store = state.clients.clone();
    let history = state
        .blocking(move || -> Result<_, ClientStoreError> {
            if store.get_client(id)?.is_none() {
                return Err(ClientStoreError::NotFound(id));
            }
            store.merge_history(id)
        })
        .await?
        .map_err(|err| client_error(&state, err))?;
    Ok(Json(history))
}
