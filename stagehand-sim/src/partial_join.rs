//! Partial-state joins and the background resync that completes them.
//!
//! A join finishes as soon as the resident server accepts the `send_join`.
//! When that server omitted membership from the returned state, the room is
//! stored as partial-state and a resync task fetches `/state_ids` at the join
//! event, pulls the bodies it is missing from `/state`, and marks the room as
//! fully stated.

use std::sync::Arc;
use std::time::Duration;

use stagehand_core::room::Pdu;

use crate::error::HomeserverError;
use crate::federation::FederationClient;
use crate::rooms::{RoomStore, SimRoom};
use crate::server::AppState;

const RESYNC_ATTEMPTS: u32 = 3;
const RESYNC_BACKOFF: Duration = Duration::from_millis(250);

/// Joins `user_id` to `room_id` through the first of `via` that accepts.
///
/// Returns once the join itself is done; a partial-state resync keeps running
/// in the background.
///
/// # Errors
///
/// - `HomeserverError::InvalidParam` - If there is no server to join through
/// - The error of the last server tried, if none accepted the join
pub(crate) async fn join_room(
    state: &AppState,
    user_id: &str,
    room_id: &str,
    via: &[String],
) -> Result<(), HomeserverError> {
    if state.rooms.is_joined(user_id, room_id) {
        tracing::debug!("{user_id} is already joined to {room_id}");
        return Ok(());
    }

    let mut last_error = None;
    for server in via {
        match join_via(state, server, user_id, room_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("Join of {room_id} via {server} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        HomeserverError::invalid_param(format!("no server to join {room_id} through"))
    }))
}

async fn join_via(
    state: &AppState,
    server: &str,
    user_id: &str,
    room_id: &str,
) -> Result<(), HomeserverError> {
    let template = state
        .federation
        .make_join(server, room_id, user_id, &state.default_room_version)
        .await?;
    if template.event.room_id != room_id || template.event.sender != user_id {
        return Err(HomeserverError::federation(
            server,
            "make_join returned an event for another room or user",
        ));
    }

    let join_event = template.event.with_computed_id()?;
    let response = state.federation.send_join(server, &join_event).await?;
    let partial = response.members_omitted;
    tracing::info!(
        "Joined {room_id} as {user_id} via {server} ({} state event(s), partial state: {partial})",
        response.state.len()
    );

    let room = state.rooms.insert_joined(
        user_id,
        SimRoom::joined(template.room_version, join_event, response.state, partial),
    );

    if partial {
        let servers = if response.servers_in_room.is_empty() {
            vec![server.to_string()]
        } else {
            response.servers_in_room
        };
        let task = tokio::spawn(resync_partial_state(
            state.federation.clone(),
            state.rooms.clone(),
            room,
            servers,
        ));
        state.resyncs.track(task);
    }
    Ok(())
}

/// Fetches the room's full state from any of `servers` and completes it.
///
/// Retries a few times before giving up; a room whose resync gave up stays
/// partial-state and blocked operations time out.
pub(crate) async fn resync_partial_state(
    federation: FederationClient,
    rooms: RoomStore,
    room: Arc<SimRoom>,
    servers: Vec<String>,
) {
    for attempt in 1..=RESYNC_ATTEMPTS {
        for server in &servers {
            match fetch_full_state(&federation, server, &room).await {
                Ok(events) => {
                    let count = events.len();
                    let position = rooms.commit(|position| room.complete_state(events, position));
                    tracing::info!(
                        "Resync of {} via {server} complete: {count} new state event(s) at s{position}",
                        room.room_id()
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "Resync of {} via {server} failed (attempt {attempt}): {e}",
                        room.room_id()
                    );
                }
            }
        }
        tokio::time::sleep(RESYNC_BACKOFF * attempt).await;
    }
    tracing::error!("Giving up resync of {}, room stays partial-state", room.room_id());
}

/// Returns the state events at the join that the room does not know yet.
async fn fetch_full_state(
    federation: &FederationClient,
    server: &str,
    room: &SimRoom,
) -> Result<Vec<Pdu>, HomeserverError> {
    let ids = federation
        .state_ids(server, room.room_id(), room.join_event_id())
        .await?;
    tracing::debug!(
        "state_ids for {}: {} state, {} auth chain",
        room.room_id(),
        ids.pdu_ids.len(),
        ids.auth_chain_ids.len()
    );

    let missing: Vec<&String> = ids
        .pdu_ids
        .iter()
        .filter(|event_id| !room.knows_state_event(event_id))
        .collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }

    let snapshot = federation
        .state(server, room.room_id(), room.join_event_id())
        .await?;
    let mut events = Vec::with_capacity(missing.len());
    for event_id in missing {
        let event = snapshot
            .pdus
            .iter()
            .find(|pdu| &pdu.event_id == event_id)
            .ok_or_else(|| {
                HomeserverError::federation(server, format!("/state response lacks {event_id}"))
            })?;
        events.push(event.clone());
    }
    Ok(events)
}
