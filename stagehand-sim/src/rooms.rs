//! In-memory room store of the simulated homeserver.
//!
//! Every change that clients can observe through `/sync` is committed under a
//! stream position. A room joined with partial state carries a full-state flag
//! that client operations wait on until the background resync completes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Value, json};
use stagehand_core::room::{MEMBER_EVENT, Pdu};
use tokio::sync::watch;

use crate::error::HomeserverError;

/// Formats a stream position as a sync token.
pub fn sync_token(position: u64) -> String {
    format!("s{position}")
}

/// Parses a sync token produced by [`sync_token`].
///
/// # Errors
///
/// - `HomeserverError::InvalidParam` - If the token is not of the form `s<n>`
pub fn parse_sync_token(token: &str) -> Result<u64, HomeserverError> {
    token
        .strip_prefix('s')
        .and_then(|position| position.parse().ok())
        .ok_or_else(|| HomeserverError::invalid_param(format!("malformed sync token {token:?}")))
}

struct RoomData {
    state: BTreeMap<(String, String), Pdu>,
    timeline: Vec<Pdu>,
    last_change: u64,
}

/// A room as seen by the simulated homeserver.
pub struct SimRoom {
    room_id: String,
    version: String,
    join_event_id: String,
    data: RwLock<RoomData>,
    full_state: watch::Sender<bool>,
}

impl SimRoom {
    /// Creates a room from a completed join.
    ///
    /// `state` is the state returned alongside the join; when `partial` is
    /// set the room waits for [`complete_state`](SimRoom::complete_state).
    pub fn joined(
        version: impl Into<String>,
        join_event: Pdu,
        state: Vec<Pdu>,
        partial: bool,
    ) -> Self {
        let mut state_map = BTreeMap::new();
        for event in state.into_iter().chain(std::iter::once(join_event.clone())) {
            if let Some(pair) = event.state_pair() {
                state_map.insert(pair, event);
            }
        }
        let (full_state, _) = watch::channel(!partial);

        Self {
            room_id: join_event.room_id.clone(),
            version: version.into(),
            join_event_id: join_event.event_id.clone(),
            data: RwLock::new(RoomData {
                state: state_map,
                timeline: vec![join_event],
                last_change: 0,
            }),
            full_state,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn join_event_id(&self) -> &str {
        &self.join_event_id
    }

    pub fn is_partial_state(&self) -> bool {
        !*self.full_state.borrow()
    }

    /// Stream position of the last change to this room.
    pub fn last_change(&self) -> u64 {
        self.data.read().last_change
    }

    fn touch(&self, position: u64) {
        self.data.write().last_change = position;
    }

    /// Checks if an event is already part of the room's known state.
    pub fn knows_state_event(&self, event_id: &str) -> bool {
        self.data
            .read()
            .state
            .values()
            .any(|event| event.event_id == event_id)
    }

    /// Merges resynced state into the room and marks it as fully stated,
    /// waking every operation blocked in [`await_full_state`].
    ///
    /// [`await_full_state`]: SimRoom::await_full_state
    pub fn complete_state(&self, events: Vec<Pdu>, position: u64) {
        {
            let mut data = self.data.write();
            for event in events {
                if let Some(pair) = event.state_pair() {
                    data.state.insert(pair, event);
                }
            }
            data.last_change = position;
        }
        self.full_state.send_replace(true);
    }

    /// Waits until the room has full state.
    ///
    /// # Errors
    ///
    /// - `HomeserverError::PartialStateTimeout` - If the resync did not finish within `timeout`
    pub async fn await_full_state(&self, timeout: Duration) -> Result<(), HomeserverError> {
        let mut receiver = self.full_state.subscribe();
        let completed = tokio::time::timeout(timeout, receiver.wait_for(|full| *full))
            .await
            .map(|changed| changed.is_ok());
        match completed {
            Ok(true) => Ok(()),
            _ => Err(HomeserverError::PartialStateTimeout {
                room_id: self.room_id.clone(),
            }),
        }
    }

    /// Returns the current state events.
    pub fn state_events(&self) -> Vec<Pdu> {
        self.data.read().state.values().cloned().collect()
    }

    /// Returns the membership events in current state.
    pub fn member_events(&self) -> Vec<Pdu> {
        self.data
            .read()
            .state
            .values()
            .filter(|event| event.kind == MEMBER_EVENT)
            .cloned()
            .collect()
    }

    /// Builds the room's `rooms.join` entry of a sync response.
    ///
    /// With `lazy_members` only the memberships of timeline senders and of
    /// `user_id` are included in the state section.
    pub fn sync_section(&self, user_id: &str, lazy_members: bool) -> Value {
        let data = self.data.read();
        let in_timeline: HashSet<&str> = data
            .timeline
            .iter()
            .map(|event| event.event_id.as_str())
            .collect();
        let relevant_members: HashSet<&str> = data
            .timeline
            .iter()
            .map(|event| event.sender.as_str())
            .chain(std::iter::once(user_id))
            .collect();

        let state: Vec<&Pdu> = data
            .state
            .values()
            .filter(|event| !in_timeline.contains(event.event_id.as_str()))
            .filter(|event| {
                !lazy_members
                    || event.kind != MEMBER_EVENT
                    || event
                        .state_key
                        .as_deref()
                        .is_some_and(|member| relevant_members.contains(member))
            })
            .collect();

        json!({
            "state": { "events": state },
            "timeline": { "events": data.timeline, "limited": false },
        })
    }
}

struct StoreInner {
    rooms: RwLock<HashMap<String, Arc<SimRoom>>>,
    joined: RwLock<HashMap<String, BTreeSet<String>>>,
    position: watch::Sender<u64>,
}

/// All rooms known to the homeserver plus the sync stream position.
#[derive(Clone)]
pub struct RoomStore {
    inner: Arc<StoreInner>,
}

impl Default for RoomStore {
    fn default() -> Self {
        let (position, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                rooms: RwLock::new(HashMap::new()),
                joined: RwLock::new(HashMap::new()),
                position,
            }),
        }
    }
}

impl RoomStore {
    /// Current stream position.
    pub fn position(&self) -> u64 {
        *self.inner.position.borrow()
    }

    /// Advances the stream and runs `apply` with the new position before the
    /// position becomes visible to readers.
    pub fn commit(&self, apply: impl FnOnce(u64)) -> u64 {
        let mut committed = 0;
        self.inner.position.send_modify(|position| {
            *position += 1;
            committed = *position;
            apply(committed);
        });
        committed
    }

    /// Waits until the stream moves past `since`. Returns whether it did.
    pub async fn await_position_after(&self, since: u64, timeout: Duration) -> bool {
        let mut receiver = self.inner.position.subscribe();
        tokio::time::timeout(timeout, receiver.wait_for(|position| *position > since))
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false)
    }

    /// Stores `room` and records `user_id` as joined to it.
    pub fn insert_joined(&self, user_id: &str, room: SimRoom) -> Arc<SimRoom> {
        let room = Arc::new(room);
        self.commit(|position| {
            room.touch(position);
            self.inner
                .rooms
                .write()
                .insert(room.room_id().to_string(), room.clone());
            self.inner
                .joined
                .write()
                .entry(user_id.to_string())
                .or_default()
                .insert(room.room_id().to_string());
        });
        room
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<SimRoom>> {
        self.inner.rooms.read().get(room_id).cloned()
    }

    pub fn is_joined(&self, user_id: &str, room_id: &str) -> bool {
        self.inner
            .joined
            .read()
            .get(user_id)
            .is_some_and(|rooms| rooms.contains(room_id))
    }

    /// Returns the rooms `user_id` is joined to, ordered by room ID.
    pub fn joined_rooms(&self, user_id: &str) -> Vec<Arc<SimRoom>> {
        let room_ids: Vec<String> = self
            .inner
            .joined
            .read()
            .get(user_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        room_ids
            .iter()
            .filter_map(|room_id| self.room(room_id))
            .collect()
    }

    /// Returns a room `user_id` is joined to.
    ///
    /// # Errors
    ///
    /// - `HomeserverError::RoomNotFound` - If the room is unknown
    /// - `HomeserverError::NotJoined` - If the user is not joined to it
    pub fn joined_room(&self, user_id: &str, room_id: &str) -> Result<Arc<SimRoom>, HomeserverError> {
        let room = self.room(room_id).ok_or_else(|| HomeserverError::RoomNotFound {
            room_id: room_id.to_string(),
        })?;
        if !self.is_joined(user_id, room_id) {
            return Err(HomeserverError::NotJoined {
                user_id: user_id.to_string(),
                room_id: room_id.to_string(),
            });
        }
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use stagehand_core::room::{EventSpec, PeerRoomState};

    use super::*;

    /// Returns the join event for alice plus the room state a partial-state
    /// join would hand back, and the membership events it omits.
    fn partial_join() -> (Pdu, Vec<Pdu>, Vec<Pdu>) {
        let mut room = PeerRoomState::build(
            "!room:peer",
            "10",
            "@charlie:peer",
            &["@derek:peer".to_string()],
        )
        .unwrap();
        let join = room
            .create_event(EventSpec::membership("@alice:hs1", "join"))
            .unwrap();
        room.accept_join(join.clone()).unwrap();

        let (members, others): (Vec<Pdu>, Vec<Pdu>) = room
            .all_current_state()
            .into_iter()
            .partition(|event| event.kind == MEMBER_EVENT);
        (join, others, members)
    }

    #[test]
    fn test_sync_token_round_trip_and_rejects_garbage() {
        assert_eq!(parse_sync_token(&sync_token(12)).unwrap(), 12);
        assert!(parse_sync_token("12").is_err());
        assert!(parse_sync_token("sx").is_err());
    }

    #[tokio::test]
    async fn test_partial_room_blocks_until_completed() {
        let (join, state, members) = partial_join();
        let room = Arc::new(SimRoom::joined("10", join, state, true));
        assert!(room.is_partial_state());
        assert!(
            room.await_full_state(Duration::from_millis(20))
                .await
                .is_err()
        );

        let waiter = {
            let room = room.clone();
            tokio::spawn(async move { room.await_full_state(Duration::from_secs(5)).await })
        };
        room.complete_state(members, 7);

        waiter.await.unwrap().unwrap();
        assert!(!room.is_partial_state());
        assert_eq!(room.last_change(), 7);
        assert_eq!(room.member_events().len(), 3);
    }

    #[test]
    fn test_partial_state_lacks_remote_members() {
        let (join, state, _) = partial_join();
        let room = SimRoom::joined("10", join.clone(), state, true);

        let members: Vec<String> = room
            .member_events()
            .into_iter()
            .filter_map(|event| event.state_key)
            .collect();
        assert_eq!(members, vec!["@alice:hs1".to_string()]);
        assert!(room.knows_state_event(&join.event_id));
    }

    #[test]
    fn test_lazy_sync_section_filters_members() {
        let (join, state, members) = partial_join();
        let room = SimRoom::joined("10", join, state, true);
        room.complete_state(members, 1);

        let full = room.sync_section("@alice:hs1", false);
        let lazy = room.sync_section("@alice:hs1", true);
        let member_count = |section: &Value| {
            section["state"]["events"]
                .as_array()
                .unwrap()
                .iter()
                .filter(|event| event["type"] == MEMBER_EVENT)
                .count()
        };

        // Alice's own join sits in the timeline, not the state section.
        assert_eq!(member_count(&full), 2);
        assert_eq!(member_count(&lazy), 0);
        assert_eq!(full["timeline"]["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_commits_positions() {
        let store = RoomStore::default();
        let (join, state, _) = partial_join();
        let room_id = join.room_id.clone();

        let room = store.insert_joined("@alice:hs1", SimRoom::joined("10", join, state, true));
        assert_eq!(store.position(), 1);
        assert_eq!(room.last_change(), 1);
        assert!(store.is_joined("@alice:hs1", &room_id));
        assert_eq!(store.joined_rooms("@alice:hs1").len(), 1);

        assert!(matches!(
            store.joined_room("@bob:hs1", &room_id),
            Err(HomeserverError::NotJoined { .. })
        ));
        assert!(matches!(
            store.joined_room("@alice:hs1", "!other:peer"),
            Err(HomeserverError::RoomNotFound { .. })
        ));

        assert!(!store.await_position_after(1, Duration::from_millis(20)).await);
        store.commit(|_| {});
        assert!(store.await_position_after(1, Duration::from_millis(20)).await);
    }
}
