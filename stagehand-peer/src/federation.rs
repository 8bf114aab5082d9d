//! Federation routes served by the peer emulator.
//!
//! The join routes implement the emulator's side of a partial-state join:
//! `make_join` hands out a template, `send_join` accepts the signed-off event
//! and answers with the room state minus membership events. Key and event
//! routes are unconditional stubs. The two state routes dispatch to the
//! [`PeerStateHandler`](crate::handlers::PeerStateHandler) installed for the
//! requested room.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use stagehand_core::HarnessError;
use stagehand_core::room::{EventSpec, MEMBER_EVENT, Pdu};

use crate::handlers::{StateEndpoint, StateQuery};
use crate::server::PeerState;

/// Builds a Matrix-style error response.
pub(crate) fn matrix_error(status: StatusCode, errcode: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "errcode": errcode, "error": message.into() })),
    )
        .into_response()
}

pub(crate) async fn server_keys(State(state): State<PeerState>) -> Json<Value> {
    let valid_until = chrono::Utc::now().timestamp_millis() + 3_600_000;
    Json(json!({
        "server_name": state.server_name,
        "valid_until_ts": valid_until,
        "verify_keys": {},
        "old_verify_keys": {},
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct MakeJoinQuery {
    ver: Option<String>,
}

pub(crate) async fn make_join(
    State(state): State<PeerState>,
    Path((room_id, user_id)): Path<(String, String)>,
    Query(query): Query<MakeJoinQuery>,
) -> Response {
    let Some(room) = state.room(&room_id) else {
        return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", format!("Unknown room {room_id}"));
    };

    let room = room.read();
    if query.ver.as_deref().is_some_and(|ver| ver != room.version()) {
        return matrix_error(
            StatusCode::BAD_REQUEST,
            "M_INCOMPATIBLE_ROOM_VERSION",
            format!("Room version {} not supported by joining server", room.version()),
        );
    }

    tracing::debug!("make_join for {user_id} in {room_id}");
    let template = room.event_template(EventSpec::membership(&user_id, "join"));
    Json(json!({
        "room_version": room.version(),
        "event": template,
    }))
    .into_response()
}

pub(crate) async fn send_join(
    State(state): State<PeerState>,
    Path((room_id, event_id)): Path<(String, String)>,
    Json(event): Json<Pdu>,
) -> Response {
    let Some(room) = state.room(&room_id) else {
        return matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", format!("Unknown room {room_id}"));
    };
    if event.event_id != event_id {
        return matrix_error(
            StatusCode::BAD_REQUEST,
            "M_BAD_JSON",
            format!("Event ID {} does not match path {event_id}", event.event_id),
        );
    }

    let mut room = room.write();
    if let Err(e) = room.accept_join(event.clone()) {
        tracing::warn!("Rejected send_join for {room_id}: {e}");
        return matrix_error(StatusCode::BAD_REQUEST, "M_BAD_JSON", e.to_string());
    }
    tracing::info!("Accepted partial-state join of {} to {room_id}", event.sender);

    // Membership is what the joining server has to resync later.
    let partial_state: Vec<Pdu> = room
        .all_current_state()
        .into_iter()
        .filter(|pdu| pdu.kind != MEMBER_EVENT)
        .collect();

    Json(json!({
        "origin": state.server_name,
        "event": event,
        "state": partial_state,
        "auth_chain": room.auth_chain(),
        "members_omitted": true,
        "servers_in_room": [state.server_name],
    }))
    .into_response()
}

pub(crate) async fn event(
    State(state): State<PeerState>,
    Path(event_id): Path<String>,
) -> Response {
    let rooms: Vec<_> = state.rooms.read().values().cloned().collect();
    let found = rooms
        .iter()
        .find_map(|room| room.read().event(&event_id).cloned());

    match found {
        Some(pdu) => Json(json!({
            "origin": state.server_name,
            "origin_server_ts": chrono::Utc::now().timestamp_millis(),
            "pdus": [pdu],
        }))
        .into_response(),
        None => matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", format!("Unknown event {event_id}")),
    }
}

pub(crate) async fn state_ids(
    state: State<PeerState>,
    room_id: Path<String>,
    query: Query<StateQuery>,
) -> Response {
    serve_state(StateEndpoint::StateIds, state, room_id, query).await
}

pub(crate) async fn state(
    state: State<PeerState>,
    room_id: Path<String>,
    query: Query<StateQuery>,
) -> Response {
    serve_state(StateEndpoint::State, state, room_id, query).await
}

async fn serve_state(
    endpoint: StateEndpoint,
    State(state): State<PeerState>,
    Path(room_id): Path<String>,
    Query(query): Query<StateQuery>,
) -> Response {
    let Some(handler) = state.state_handler(endpoint, &room_id) else {
        return matrix_error(
            StatusCode::NOT_FOUND,
            "M_NOT_FOUND",
            format!("No {endpoint} handler for room {room_id}"),
        );
    };

    let reply = match handler.handle(query.event_id.as_deref()).await {
        Ok(reply) => reply,
        Err(e) => {
            state.failures.record(e);
            return matrix_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "M_UNKNOWN",
                format!("{endpoint} handler failed"),
            );
        }
    };

    match serde_json::to_vec(&reply) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => {
            state.failures.record(HarnessError::ResponseWrite {
                endpoint: endpoint.name().to_string(),
                reason: e.to_string(),
            });
            matrix_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "M_UNKNOWN",
                format!("Failed to encode {endpoint} response"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use stagehand_core::{HarnessConfig, RendezvousGate};
    use tower::ServiceExt;

    use super::*;
    use crate::handlers::{PeerStateHandler, SharedRoom};
    use crate::server::PeerServer;

    async fn server_with_room() -> (PeerServer, SharedRoom) {
        let server = PeerServer::bind(&HarnessConfig::for_testing()).await.unwrap();
        let room = server
            .make_room(
                "10",
                &server.user_id("charlie"),
                &[server.user_id("derek")],
            )
            .unwrap();
        (server, room)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn encoded(id: &str) -> String {
        id.replace('!', "%21").replace(':', "%3A").replace('$', "%24").replace('@', "%40")
    }

    #[tokio::test]
    async fn test_state_ids_route_serves_installed_handler() {
        let (server, room) = server_with_room().await;
        let room_id = room.read().room_id().to_string();
        server
            .handle_state_requests(PeerStateHandler::state_ids(room.clone()))
            .unwrap();

        let response = server
            .router()
            .oneshot(get(format!(
                "/_matrix/federation/v1/state_ids/{}?event_id=%24join",
                encoded(&room_id)
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["pdu_ids"].as_array().unwrap().len(), 5);
        assert!(body["auth_chain_ids"].as_array().unwrap().len() >= 3);
    }

    #[tokio::test]
    async fn test_state_route_without_handler_is_not_found() {
        let (server, room) = server_with_room().await;
        let room_id = room.read().room_id().to_string();

        let response = server
            .router()
            .oneshot(get(format!("/_matrix/federation/v1/state/{}", encoded(&room_id))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["errcode"], "M_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_timed_out_handler_records_failure() {
        let (server, room) = server_with_room().await;
        let room_id = room.read().room_id().to_string();
        server
            .handle_state_requests(
                PeerStateHandler::state_ids(room)
                    .with_may_respond(RendezvousGate::new("never"), Duration::from_millis(20)),
            )
            .unwrap();

        let response = server
            .router()
            .oneshot(get(format!(
                "/_matrix/federation/v1/state_ids/{}",
                encoded(&room_id)
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let failures = server.failures().drain();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_timeout());
    }

    #[tokio::test]
    async fn test_make_join_then_send_join_adds_member() {
        let (server, room) = server_with_room().await;
        let room_id = room.read().room_id().to_string();
        let alice = "@alice:hs1";

        let response = server
            .router()
            .oneshot(get(format!(
                "/_matrix/federation/v1/make_join/{}/{}?ver=10",
                encoded(&room_id),
                encoded(alice)
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let template: Pdu = serde_json::from_value(body_json(response).await["event"].clone()).unwrap();
        let join = template.with_computed_id().unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(format!(
                        "/_matrix/federation/v2/send_join/{}/{}",
                        encoded(&room_id),
                        encoded(&join.event_id)
                    ))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&join).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["members_omitted"], true);
        let omitted_members = body["state"]
            .as_array()
            .unwrap()
            .iter()
            .all(|event| event["type"] != MEMBER_EVENT);
        assert!(omitted_members);
        assert!(room.read().joined_members().contains(&alice.to_string()));
    }

    #[tokio::test]
    async fn test_make_join_rejects_unsupported_version() {
        let (server, room) = server_with_room().await;
        let room_id = room.read().room_id().to_string();

        let response = server
            .router()
            .oneshot(get(format!(
                "/_matrix/federation/v1/make_join/{}/{}?ver=1",
                encoded(&room_id),
                encoded("@alice:hs1")
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["errcode"], "M_INCOMPATIBLE_ROOM_VERSION");
    }

    #[tokio::test]
    async fn test_event_route_finds_room_events() {
        let (server, room) = server_with_room().await;
        let create_id = room.read().timeline()[0].event_id.clone();

        let response = server
            .router()
            .oneshot(get(format!("/_matrix/federation/v1/event/{}", encoded(&create_id))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["pdus"][0]["event_id"], create_id.as_str());
    }

    #[tokio::test]
    async fn test_unknown_room_rejected_by_make_join() {
        let server = PeerServer::bind(&HarnessConfig::for_testing()).await.unwrap();

        let response = server
            .router()
            .oneshot(get(format!(
                "/_matrix/federation/v1/make_join/{}/{}",
                encoded("!missing:peer"),
                encoded("@alice:hs1")
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
