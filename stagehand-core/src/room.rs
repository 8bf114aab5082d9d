//! Room model used by the peer emulator.
//!
//! Events are simplified Matrix PDUs: enough structure for auth chains, state
//! maps and membership, without signatures or room-version auth rules.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use rand::distr::Alphanumeric;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha1::{Digest, Sha1};

use crate::error::{HarnessError, Result};

pub const CREATE_EVENT: &str = "m.room.create";
pub const MEMBER_EVENT: &str = "m.room.member";
pub const POWER_LEVELS_EVENT: &str = "m.room.power_levels";
pub const JOIN_RULES_EVENT: &str = "m.room.join_rules";

/// A persistent data unit: one room event as exchanged over federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pdu {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub auth_events: Vec<String>,
    #[serde(default)]
    pub prev_events: Vec<String>,
    pub depth: u64,
    pub origin_server_ts: i64,
}

impl Pdu {
    /// Checks if this event carries a state key.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Returns the `(type, state_key)` pair for state events.
    pub fn state_pair(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|state_key| (self.kind.clone(), state_key.clone()))
    }

    /// Returns the membership value of an `m.room.member` event.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != MEMBER_EVENT {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str)
    }

    /// Derives the event ID from the event's canonical JSON.
    ///
    /// The ID is `$` followed by the hex SHA-1 of every field except
    /// `event_id`. serde_json maps are sorted, which keeps the encoding stable.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Json` - If the event cannot be serialized
    pub fn compute_event_id(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("event_id");
        }
        let canonical = serde_json::to_vec(&value)?;
        let digest = Sha1::digest(&canonical);
        Ok(format!("${}", hex::encode(digest)))
    }

    /// Fills in the event ID derived from the event's contents.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Json` - If the event cannot be serialized
    pub fn with_computed_id(mut self) -> Result<Self> {
        self.event_id = self.compute_event_id()?;
        Ok(self)
    }
}

/// Description of an event before it is placed in a room.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub kind: String,
    pub state_key: Option<String>,
    pub sender: String,
    pub content: Value,
}

impl EventSpec {
    /// Creates a state event description.
    pub fn state(
        kind: impl Into<String>,
        state_key: impl Into<String>,
        sender: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            state_key: Some(state_key.into()),
            sender: sender.into(),
            content,
        }
    }

    /// Creates a membership event where `user_id` sets its own membership.
    pub fn membership(user_id: &str, membership: &str) -> Self {
        Self::state(
            MEMBER_EVENT,
            user_id,
            user_id,
            json!({ "membership": membership }),
        )
    }
}

/// Events that open every emulated room: creation, the creator's join,
/// power levels and a public join rule.
pub fn initial_room_events(room_version: &str, creator: &str) -> Vec<EventSpec> {
    vec![
        EventSpec::state(
            CREATE_EVENT,
            "",
            creator,
            json!({ "creator": creator, "room_version": room_version }),
        ),
        EventSpec::membership(creator, "join"),
        EventSpec::state(
            POWER_LEVELS_EVENT,
            "",
            creator,
            json!({
                "ban": 50,
                "events_default": 0,
                "invite": 0,
                "kick": 50,
                "redact": 50,
                "state_default": 50,
                "users": { creator: 100 },
                "users_default": 0,
            }),
        ),
        EventSpec::state(
            JOIN_RULES_EVENT,
            "",
            creator,
            json!({ "join_rule": "public" }),
        ),
    ]
}

/// The peer emulator's view of one room.
///
/// Keeps the full timeline, an index by event ID and the current state map.
/// A later state event for the same `(type, state_key)` replaces the earlier
/// one in current state.
#[derive(Debug, Clone)]
pub struct PeerRoomState {
    room_id: String,
    version: String,
    events: Vec<Pdu>,
    index: HashMap<String, usize>,
    current_state: BTreeMap<(String, String), String>,
}

impl PeerRoomState {
    /// Creates an empty room. Callers add the creation event first.
    pub fn new(room_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            version: version.into(),
            events: Vec::new(),
            index: HashMap::new(),
            current_state: BTreeMap::new(),
        }
    }

    /// Builds a room with the initial events for `creator` followed by a
    /// join for each of `members`.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If the resulting room violates its invariants
    /// - `HarnessError::Json` - If an event cannot be hashed
    pub fn build(
        room_id: impl Into<String>,
        version: impl Into<String>,
        creator: &str,
        members: &[String],
    ) -> Result<Self> {
        let version = version.into();
        let mut room = Self::new(room_id, version.clone());

        for spec in initial_room_events(&version, creator) {
            let event = room.create_event(spec)?;
            room.add_event(event);
        }
        for member in members.iter().filter(|member| member.as_str() != creator) {
            let event = room.create_event(EventSpec::membership(member, "join"))?;
            room.add_event(event);
        }

        room.validate()?;
        Ok(room)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns every event in the order it was added.
    pub fn timeline(&self) -> &[Pdu] {
        &self.events
    }

    pub fn event(&self, event_id: &str) -> Option<&Pdu> {
        self.index.get(event_id).map(|&position| &self.events[position])
    }

    /// Returns the current state event for `(kind, state_key)`.
    pub fn current_state_event(&self, kind: &str, state_key: &str) -> Option<&Pdu> {
        self.current_state
            .get(&(kind.to_string(), state_key.to_string()))
            .and_then(|event_id| self.event(event_id))
    }

    /// Appends an event and updates current state if it is a state event.
    pub fn add_event(&mut self, event: Pdu) {
        if let Some(pair) = event.state_pair() {
            self.current_state.insert(pair, event.event_id.clone());
        }
        self.index.insert(event.event_id.clone(), self.events.len());
        self.events.push(event);
    }

    /// Places `spec` at the head of the room: picks auth events, points
    /// `prev_events` at the latest event and derives the event ID.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Json` - If the event cannot be hashed
    pub fn create_event(&self, spec: EventSpec) -> Result<Pdu> {
        self.event_template(spec).with_computed_id()
    }

    /// Builds an event for `spec` without an event ID, as handed out in a
    /// `make_join` response.
    pub fn event_template(&self, spec: EventSpec) -> Pdu {
        let auth_events = self.auth_events_for(&spec);
        let (prev_events, depth) = match self.events.last() {
            Some(latest) => (vec![latest.event_id.clone()], latest.depth + 1),
            None => (Vec::new(), 1),
        };

        Pdu {
            event_id: String::new(),
            room_id: self.room_id.clone(),
            sender: spec.sender,
            kind: spec.kind,
            state_key: spec.state_key,
            content: spec.content,
            auth_events,
            prev_events,
            depth,
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Selects the auth events an event described by `spec` would cite.
    fn auth_events_for(&self, spec: &EventSpec) -> Vec<String> {
        if spec.kind == CREATE_EVENT {
            return Vec::new();
        }

        let mut wanted = vec![
            (CREATE_EVENT, String::new()),
            (POWER_LEVELS_EVENT, String::new()),
            (MEMBER_EVENT, spec.sender.clone()),
        ];
        if spec.kind == MEMBER_EVENT {
            if let Some(target) = spec.state_key.as_ref().filter(|target| **target != spec.sender) {
                wanted.push((MEMBER_EVENT, target.clone()));
            }
            if spec.content.get("membership").and_then(Value::as_str) == Some("join") {
                wanted.push((JOIN_RULES_EVENT, String::new()));
            }
        }

        let mut auth_events = Vec::new();
        for (kind, state_key) in wanted {
            if let Some(event) = self.current_state_event(kind, &state_key)
                && !auth_events.contains(&event.event_id)
            {
                auth_events.push(event.event_id.clone());
            }
        }
        auth_events
    }

    /// Returns the current state events in timeline order.
    pub fn all_current_state(&self) -> Vec<Pdu> {
        let current: HashSet<&String> = self.current_state.values().collect();
        self.events
            .iter()
            .filter(|event| current.contains(&event.event_id))
            .cloned()
            .collect()
    }

    /// Returns the transitive auth events of the current state, in timeline
    /// order.
    pub fn auth_chain(&self) -> Vec<Pdu> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<String> = self
            .current_state
            .values()
            .filter_map(|event_id| self.event(event_id))
            .flat_map(|event| event.auth_events.iter().cloned())
            .collect();

        while let Some(event_id) = queue.pop_front() {
            if !seen.insert(event_id.clone()) {
                continue;
            }
            if let Some(event) = self.event(&event_id) {
                queue.extend(event.auth_events.iter().cloned());
            }
        }

        self.events
            .iter()
            .filter(|event| seen.contains(&event.event_id))
            .cloned()
            .collect()
    }

    /// Returns the user IDs whose current membership is `join`, sorted.
    pub fn joined_members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .current_state
            .iter()
            .filter(|((kind, _), _)| kind == MEMBER_EVENT)
            .filter_map(|((_, user_id), event_id)| {
                self.event(event_id)
                    .filter(|event| event.membership() == Some("join"))
                    .map(|_| user_id.clone())
            })
            .collect();
        members.sort();
        members
    }

    /// Checks the structural invariants of the room.
    ///
    /// Every state event other than the creation event must cite auth events
    /// that exist in the room and lead back to the creation event.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - Naming the first event that breaks an invariant
    pub fn validate(&self) -> Result<()> {
        let create = self
            .current_state_event(CREATE_EVENT, "")
            .ok_or_else(|| HarnessError::setup(format!("room {} has no create event", self.room_id)))?;

        for event in self.all_current_state() {
            if event.event_id == create.event_id {
                continue;
            }
            if !self.reaches_event(&event, &create.event_id) {
                return Err(HarnessError::setup(format!(
                    "state event {} ({}) is not anchored to the create event",
                    event.event_id, event.kind
                )));
            }
        }
        Ok(())
    }

    fn reaches_event(&self, from: &Pdu, target: &str) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&String> = from.auth_events.iter().collect();
        while let Some(event_id) = queue.pop_front() {
            if event_id == target {
                return true;
            }
            if !seen.insert(event_id) {
                continue;
            }
            match self.event(event_id) {
                Some(event) => queue.extend(event.auth_events.iter()),
                None => return false,
            }
        }
        false
    }

    /// Accepts a signed-off join event from a remote server.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If the event is not a self-join for this room,
    ///   its ID does not match its contents, or it cites unknown auth events
    pub fn accept_join(&mut self, event: Pdu) -> Result<()> {
        if event.room_id != self.room_id {
            return Err(HarnessError::setup(format!(
                "join for room {} sent to room {}",
                event.room_id, self.room_id
            )));
        }
        if event.membership() != Some("join") || event.state_key.as_deref() != Some(event.sender.as_str()) {
            return Err(HarnessError::setup(format!(
                "event {} is not a self-join",
                event.event_id
            )));
        }
        let expected_id = event.compute_event_id()?;
        if expected_id != event.event_id {
            return Err(HarnessError::setup(format!(
                "event ID mismatch: got {}, expected {}",
                event.event_id, expected_id
            )));
        }
        if let Some(missing) = event.auth_events.iter().find(|id| self.event(id).is_none()) {
            return Err(HarnessError::setup(format!("unknown auth event {missing}")));
        }

        self.add_event(event);
        Ok(())
    }
}

/// Deterministic generator for room identifiers.
pub struct RoomIdGenerator {
    rng: ChaCha8Rng,
}

impl RoomIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Returns a fresh room ID on `server_name`.
    pub fn next_room_id(&mut self, server_name: &str) -> String {
        let localpart: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(18)
            .map(char::from)
            .collect();
        format!("!{localpart}:{server_name}")
    }
}
