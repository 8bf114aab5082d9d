//! Client API handlers.

use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::HomeserverError;
use crate::partial_join;
use crate::rooms::{parse_sync_token, sync_token};
use crate::server::{AppState, AuthenticatedUser};

/// Upper bound on how long an incremental sync long-polls.
const MAX_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn capabilities(State(state): State<AppState>) -> Json<Value> {
    let mut available = Map::new();
    available.insert(state.default_room_version.clone(), json!("stable"));

    Json(json!({
        "capabilities": {
            "m.room_versions": {
                "default": state.default_room_version,
                "available": available,
            },
        },
    }))
}

pub(crate) async fn join(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Path(room_id): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, HomeserverError> {
    let mut via: Vec<String> = params
        .into_iter()
        .filter(|(key, _)| key == "server_name")
        .map(|(_, server)| server)
        .collect();
    if via.is_empty()
        && let Some((_, server)) = room_id.split_once(':')
    {
        via.push(server.to_string());
    }

    partial_join::join_room(&state, &user_id, &room_id, &via).await?;
    Ok(Json(json!({ "room_id": room_id })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SyncParams {
    since: Option<String>,
    filter: Option<String>,
    timeout: Option<u64>,
}

/// Checks whether an inline JSON filter asks for lazy-loaded members.
fn lazy_loads_members(filter: &str) -> bool {
    let Ok(filter) = serde_json::from_str::<Value>(filter) else {
        return false;
    };
    ["/room/state/lazy_load_members", "/room/timeline/lazy_load_members"]
        .iter()
        .any(|pointer| filter.pointer(pointer).and_then(Value::as_bool) == Some(true))
}

pub(crate) async fn sync(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Query(params): Query<SyncParams>,
) -> Result<Json<Value>, HomeserverError> {
    let lazy_members = params.filter.as_deref().is_some_and(lazy_loads_members);
    let since = params.since.as_deref().map(parse_sync_token).transpose()?;

    if !lazy_members {
        for room in state.rooms.joined_rooms(&user_id) {
            if room.is_partial_state() {
                tracing::info!("Sync for {user_id} waiting on full state of {}", room.room_id());
                room.await_full_state(state.partial_state_timeout).await?;
            }
        }
    }

    if let Some(since) = since
        && let Some(timeout) = params.timeout.filter(|timeout| *timeout > 0)
        && state.rooms.position() <= since
    {
        let timeout = Duration::from_millis(timeout).min(MAX_SYNC_TIMEOUT);
        state.rooms.await_position_after(since, timeout).await;
    }

    let position = state.rooms.position();
    let mut joined = Map::new();
    for room in state.rooms.joined_rooms(&user_id) {
        if since.is_some_and(|since| room.last_change() <= since) {
            continue;
        }
        joined.insert(
            room.room_id().to_string(),
            room.sync_section(&user_id, lazy_members),
        );
    }

    Ok(Json(json!({
        "next_batch": sync_token(position),
        "rooms": { "join": joined },
    })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MembersParams {
    at: Option<String>,
}

pub(crate) async fn members(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Path(room_id): Path<String>,
    Query(params): Query<MembersParams>,
) -> Result<Json<Value>, HomeserverError> {
    let room = state.rooms.joined_room(&user_id, &room_id)?;
    if let Some(at) = params.at.as_deref() {
        parse_sync_token(at)?;
    }

    if room.is_partial_state() {
        tracing::info!("/members for {room_id} waiting on full state");
    }
    room.await_full_state(state.partial_state_timeout).await?;
    Ok(Json(json!({ "chunk": room.member_events() })))
}

pub(crate) async fn room_state(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Path(room_id): Path<String>,
) -> Result<Json<Value>, HomeserverError> {
    let room = state.rooms.joined_room(&user_id, &room_id)?;

    if room.is_partial_state() {
        tracing::info!("/state for {room_id} waiting on full state");
    }
    room.await_full_state(state.partial_state_timeout).await?;
    Ok(Json(json!(room.state_events())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_filter_detection() {
        assert!(lazy_loads_members(&stagehand_core::build_lazy_loading_sync_filter()));
        assert!(lazy_loads_members(r#"{"room":{"state":{"lazy_load_members":true}}}"#));
        assert!(!lazy_loads_members(r#"{"room":{"state":{"lazy_load_members":false}}}"#));
        assert!(!lazy_loads_members("42"));
        assert!(!lazy_loads_members("not json"));
    }
}
