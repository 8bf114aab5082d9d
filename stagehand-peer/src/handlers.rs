//! Gated handlers for the federation state endpoints.
//!
//! A [`PeerStateHandler`] answers `/state_ids` or `/state` for one room from
//! the emulator's room state. Optionally it finishes a "request received" gate
//! when a request arrives and holds the response until a "may respond" gate is
//! finished, which is how a test pins the server under test mid-resync.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use stagehand_core::room::{Pdu, PeerRoomState};
use stagehand_core::{RendezvousGate, Result};

/// Room state shared between the emulator's join handlers and state handlers.
pub type SharedRoom = Arc<RwLock<PeerRoomState>>;

/// The two state-resolution endpoints a handler can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEndpoint {
    /// `GET /_matrix/federation/v1/state_ids/{roomId}`
    StateIds,
    /// `GET /_matrix/federation/v1/state/{roomId}`
    State,
}

impl StateEndpoint {
    /// Returns the endpoint name as used in log lines and gate labels.
    pub fn name(self) -> &'static str {
        match self {
            StateEndpoint::StateIds => "/state_ids",
            StateEndpoint::State => "/state",
        }
    }
}

impl std::fmt::Display for StateEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Query parameters accepted by both state endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StateQuery {
    pub event_id: Option<String>,
}

/// Body of a `/state_ids` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateIdsResponse {
    pub auth_chain_ids: Vec<String>,
    pub pdu_ids: Vec<String>,
}

/// Body of a `/state` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub auth_chain: Vec<Pdu>,
    pub pdus: Vec<Pdu>,
}

/// Response produced by a [`PeerStateHandler`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateReply {
    Ids(StateIdsResponse),
    Full(StateResponse),
}

/// Handler for one state endpoint of one room.
///
/// Without gates it answers immediately. Gates are only read here; the
/// session that created them owns their lifetime.
#[derive(Clone)]
pub struct PeerStateHandler {
    endpoint: StateEndpoint,
    room: SharedRoom,
    request_received: Option<RendezvousGate>,
    may_respond: Option<(RendezvousGate, Duration)>,
}

impl PeerStateHandler {
    /// Creates an ungated `/state_ids` handler for `room`.
    pub fn state_ids(room: SharedRoom) -> Self {
        Self::new(StateEndpoint::StateIds, room)
    }

    /// Creates an ungated `/state` handler for `room`.
    pub fn state(room: SharedRoom) -> Self {
        Self::new(StateEndpoint::State, room)
    }

    fn new(endpoint: StateEndpoint, room: SharedRoom) -> Self {
        Self {
            endpoint,
            room,
            request_received: None,
            may_respond: None,
        }
    }

    /// Finishes `gate` whenever a request arrives.
    pub fn with_request_received(mut self, gate: RendezvousGate) -> Self {
        self.request_received = Some(gate);
        self
    }

    /// Holds each response until `gate` is finished, for at most `timeout`.
    pub fn with_may_respond(mut self, gate: RendezvousGate, timeout: Duration) -> Self {
        self.may_respond = Some((gate, timeout));
        self
    }

    pub fn endpoint(&self) -> StateEndpoint {
        self.endpoint
    }

    /// Returns the ID of the room this handler serves.
    pub fn room_id(&self) -> String {
        self.room.read().room_id().to_string()
    }

    /// Handles one request: signal arrival, wait for permission, then build
    /// the response from the current room state.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If the may-respond gate was not finished in time
    pub async fn handle(&self, event_id: Option<&str>) -> Result<StateReply> {
        let room_id = self.room_id();
        tracing::info!(
            "Incoming {} request for event {:?} in room {}",
            self.endpoint,
            event_id,
            room_id
        );

        if let Some(gate) = &self.request_received {
            gate.finish();
        }
        if let Some((gate, timeout)) = &self.may_respond {
            gate.wait(*timeout, &format!("Waiting for {} request", self.endpoint))
                .await?;
        }
        tracing::info!("Replying to {} request", self.endpoint);

        let (auth_chain, current_state) = {
            let room = self.room.read();
            (room.auth_chain(), room.all_current_state())
        };

        Ok(match self.endpoint {
            StateEndpoint::StateIds => StateReply::Ids(StateIdsResponse {
                auth_chain_ids: event_ids(&auth_chain),
                pdu_ids: event_ids(&current_state),
            }),
            StateEndpoint::State => StateReply::Full(StateResponse {
                auth_chain,
                pdus: current_state,
            }),
        })
    }
}

fn event_ids(events: &[Pdu]) -> Vec<String> {
    events.iter().map(|event| event.event_id.clone()).collect()
}
