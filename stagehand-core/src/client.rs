//! Client driver used to exercise the server under test.
//!
//! Scenarios talk to the client-facing service through [`ClientDriver`] so the
//! harness does not care whether the other end is a real deployment or the
//! in-workspace simulated homeserver.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;

use crate::error::{HarnessError, Result};

/// Long-poll bound given to follow-up syncs that did not set their own.
pub const FOLLOW_UP_SYNC_TIMEOUT_MS: u64 = 1000;

/// Parameters of a `/sync` request.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Token from a previous sync's `next_batch`
    pub since: Option<String>,
    /// JSON-encoded filter
    pub filter: Option<String>,
    /// Long-poll timeout the server may use when nothing is pending
    pub timeout_ms: Option<u64>,
}

impl SyncRequest {
    /// Creates a sync request that lazy-loads room members.
    pub fn lazy_loading() -> Self {
        Self {
            filter: Some(build_lazy_loading_sync_filter()),
            ..Default::default()
        }
    }

    /// Returns a copy of this request continuing from `since`.
    pub fn since(&self, since: impl Into<String>) -> Self {
        Self {
            since: Some(since.into()),
            ..self.clone()
        }
    }
}

/// Builds a JSON filter enabling `lazy_load_members` for both the timeline
/// and state sections of every room.
pub fn build_lazy_loading_sync_filter() -> String {
    json!({
        "room": {
            "timeline": { "lazy_load_members": true },
            "state": { "lazy_load_members": true },
        }
    })
    .to_string()
}

/// Client-visible operations a scenario drives against the server under test.
#[async_trait]
pub trait ClientDriver: Send + Sync {
    /// Returns the fully qualified user ID this driver acts as.
    fn user_id(&self) -> &str;

    /// Returns the server's default room version.
    async fn default_room_version(&self) -> Result<String>;

    /// Joins `room_id` through any of `via` servers and returns the room ID.
    async fn join_room(&self, room_id: &str, via: &[String]) -> Result<String>;

    /// Performs one sync and returns the raw response body.
    async fn sync(&self, request: &SyncRequest) -> Result<Value>;

    /// Fetches `/members` for a room, optionally as of a sync token.
    async fn members(&self, room_id: &str, at: Option<&str>) -> Result<Value>;

    /// Fetches the full current state of a room.
    async fn room_state(&self, room_id: &str) -> Result<Value>;
}

/// Syncs repeatedly until `room_id` shows up under `rooms.join`.
///
/// Returns the `next_batch` token of the sync that saw the room. Follow-up
/// syncs long-poll for [`FOLLOW_UP_SYNC_TIMEOUT_MS`] unless `request` already
/// carries a timeout.
///
/// # Errors
///
/// - `HarnessError::Timeout` - If the room did not appear within `timeout`
/// - Any error returned by the driver's `sync`
pub async fn sync_until_joined(
    client: &dyn ClientDriver,
    request: &SyncRequest,
    room_id: &str,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    let mut request = request.clone();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HarnessError::timeout(
                format!("{} syncing until joined to {room_id}", client.user_id()),
                timeout,
            ));
        }

        let response = tokio::time::timeout(remaining, client.sync(&request))
            .await
            .map_err(|_| {
                HarnessError::timeout(
                    format!("{} syncing until joined to {room_id}", client.user_id()),
                    timeout,
                )
            })??;

        let next_batch = response
            .get("next_batch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if joined_room(&response, room_id).is_some() {
            return Ok(next_batch);
        }
        request = request.since(next_batch);
        if request.timeout_ms.is_none() {
            request.timeout_ms = Some(FOLLOW_UP_SYNC_TIMEOUT_MS);
        }
    }
}

/// Returns the `rooms.join.<room_id>` section of a sync response.
pub fn joined_room<'a>(sync_response: &'a Value, room_id: &str) -> Option<&'a Value> {
    sync_response
        .get("rooms")
        .and_then(|rooms| rooms.get("join"))
        .and_then(|join| join.get(room_id))
}

/// Collects `type|state_key` keys for every event in `events`.
pub fn state_keys(events: &[Value]) -> BTreeSet<String> {
    events
        .iter()
        .map(|event| {
            let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
            let state_key = event
                .get("state_key")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{kind}|{state_key}")
        })
        .collect()
}

/// Collects the user IDs of `m.room.member` events with membership `join`.
pub fn joined_user_ids(events: &[Value]) -> BTreeSet<String> {
    events
        .iter()
        .filter(|event| event.get("type").and_then(Value::as_str) == Some("m.room.member"))
        .filter(|event| {
            event
                .get("content")
                .and_then(|content| content.get("membership"))
                .and_then(Value::as_str)
                == Some("join")
        })
        .filter_map(|event| event.get("state_key").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

/// Collects the joined members visible in a sync response's room section,
/// across both its `state` and `timeline` events.
pub fn room_section_members(room: &Value) -> BTreeSet<String> {
    ["/state/events", "/timeline/events"]
        .iter()
        .filter_map(|pointer| room.pointer(pointer).and_then(Value::as_array))
        .flat_map(|events| joined_user_ids(events))
        .collect()
}

/// [`ClientDriver`] speaking the client-server HTTP API with reqwest.
#[derive(Clone)]
pub struct HttpClientDriver {
    http: reqwest::Client,
    base_url: Url,
    user_id: String,
    access_token: String,
}

impl HttpClientDriver {
    /// Creates a driver for `user_id` against the server at `base_url`.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If `base_url` is not a valid base URL
    pub fn new(
        base_url: &str,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(HarnessError::setup)?;
        if base_url.cannot_be_a_base() {
            return Err(HarnessError::setup(format!("{base_url} cannot be a base URL")));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            user_id: user_id.into(),
            access_token: access_token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(HarnessError::setup)
    }

    fn room_endpoint(&self, room_id: &str, suffix: &str) -> Result<Url> {
        self.endpoint(&format!(
            "_matrix/client/r0/rooms/{}/{suffix}",
            urlencoding::encode(room_id)
        ))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HarnessError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl ClientDriver for HttpClientDriver {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn default_room_version(&self) -> Result<String> {
        let url = self.endpoint("_matrix/client/r0/capabilities")?;
        let body = self.send(self.http.get(url)).await?;
        body.pointer("/capabilities/m.room_versions/default")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HarnessError::setup("capabilities response has no default room version"))
    }

    async fn join_room(&self, room_id: &str, via: &[String]) -> Result<String> {
        let url = self.endpoint(&format!(
            "_matrix/client/r0/join/{}",
            urlencoding::encode(room_id)
        ))?;
        let query: Vec<(&str, &str)> = via
            .iter()
            .map(|server| ("server_name", server.as_str()))
            .collect();

        tracing::debug!(user = %self.user_id, %room_id, ?via, "Joining room");
        let body = self
            .send(self.http.post(url).query(&query).json(&json!({})))
            .await?;
        body.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HarnessError::setup("join response has no room_id"))
    }

    async fn sync(&self, request: &SyncRequest) -> Result<Value> {
        let url = self.endpoint("_matrix/client/r0/sync")?;
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = &request.since {
            query.push(("since", since.clone()));
        }
        if let Some(filter) = &request.filter {
            query.push(("filter", filter.clone()));
        }
        if let Some(timeout_ms) = request.timeout_ms {
            query.push(("timeout", timeout_ms.to_string()));
        }
        self.send(self.http.get(url).query(&query)).await
    }

    async fn members(&self, room_id: &str, at: Option<&str>) -> Result<Value> {
        let url = self.room_endpoint(room_id, "members")?;
        let query: Vec<(&str, &str)> = at.map(|at| vec![("at", at)]).unwrap_or_default();
        self.send(self.http.get(url).query(&query)).await
    }

    async fn room_state(&self, room_id: &str) -> Result<Value> {
        let url = self.room_endpoint(room_id, "state")?;
        self.send(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_loading_filter_shape() {
        let filter: Value = serde_json::from_str(&build_lazy_loading_sync_filter()).unwrap();

        assert_eq!(filter.pointer("/room/timeline/lazy_load_members"), Some(&json!(true)));
        assert_eq!(filter.pointer("/room/state/lazy_load_members"), Some(&json!(true)));
    }

    #[test]
    fn test_driver_rejects_invalid_base_url() {
        assert!(HttpClientDriver::new("not a url", "@alice:hs1", "token").is_err());
        assert!(HttpClientDriver::new("mailto:alice@example.org", "@alice:hs1", "token").is_err());
    }

    #[test]
    fn test_room_endpoint_encodes_room_id() {
        let driver = HttpClientDriver::new("http://127.0.0.1:8008", "@alice:hs1", "token").unwrap();
        let url = driver.room_endpoint("!abc:peer", "members").unwrap();

        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8008/_matrix/client/r0/rooms/%21abc%3Apeer/members"
        );
    }

    #[test]
    fn test_state_key_helpers() {
        let events = vec![
            json!({ "type": "m.room.member", "state_key": "@alice:hs1", "content": { "membership": "join" } }),
            json!({ "type": "m.room.member", "state_key": "@bob:hs1", "content": { "membership": "leave" } }),
            json!({ "type": "m.room.create", "state_key": "", "content": {} }),
        ];

        let keys = state_keys(&events);
        assert!(keys.contains("m.room.member|@alice:hs1"));
        assert!(keys.contains("m.room.create|"));

        let joined = joined_user_ids(&events);
        assert_eq!(joined.into_iter().collect::<Vec<_>>(), vec!["@alice:hs1".to_string()]);
    }

    #[test]
    fn test_room_section_members_spans_state_and_timeline() {
        let room = json!({
            "state": { "events": [
                { "type": "m.room.member", "state_key": "@charlie:peer", "content": { "membership": "join" } },
            ] },
            "timeline": { "events": [
                { "type": "m.room.member", "state_key": "@alice:hs1", "content": { "membership": "join" } },
            ] },
        });

        let members = room_section_members(&room);
        assert_eq!(members.len(), 2);
        assert!(members.contains("@alice:hs1"));
        assert!(room_section_members(&json!({})).is_empty());
    }

    /// Driver whose syncs never show a joined room and honour the long-poll
    /// timeout of incremental requests.
    struct NeverJoinedClient {
        syncs: std::sync::Mutex<Vec<SyncRequest>>,
    }

    #[async_trait]
    impl ClientDriver for NeverJoinedClient {
        fn user_id(&self) -> &str {
            "@alice:hs1"
        }

        async fn default_room_version(&self) -> Result<String> {
            Ok("10".to_string())
        }

        async fn join_room(&self, room_id: &str, _via: &[String]) -> Result<String> {
            Ok(room_id.to_string())
        }

        async fn sync(&self, request: &SyncRequest) -> Result<Value> {
            let count = {
                let mut syncs = self.syncs.lock().unwrap();
                syncs.push(request.clone());
                syncs.len()
            };
            if request.since.is_some()
                && let Some(timeout_ms) = request.timeout_ms
            {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            }
            Ok(json!({ "next_batch": format!("s{count}"), "rooms": { "join": {} } }))
        }

        async fn members(&self, _room_id: &str, _at: Option<&str>) -> Result<Value> {
            Ok(json!({ "chunk": [] }))
        }

        async fn room_state(&self, _room_id: &str) -> Result<Value> {
            Ok(json!([]))
        }
    }

    #[tokio::test]
    async fn test_sync_until_joined_long_polls_follow_up_syncs() {
        let client = NeverJoinedClient {
            syncs: std::sync::Mutex::new(Vec::new()),
        };

        let error = sync_until_joined(
            &client,
            &SyncRequest::default(),
            "!r:peer",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(error.is_timeout());

        let syncs = client.syncs.lock().unwrap();
        assert_eq!(syncs.len(), 2);
        assert_eq!(syncs[0].timeout_ms, None);
        assert_eq!(syncs[1].since.as_deref(), Some("s1"));
        assert_eq!(syncs[1].timeout_ms, Some(FOLLOW_UP_SYNC_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn test_sync_until_joined_keeps_caller_timeout() {
        let client = NeverJoinedClient {
            syncs: std::sync::Mutex::new(Vec::new()),
        };
        let request = SyncRequest {
            timeout_ms: Some(150),
            ..SyncRequest::default()
        };

        let error = sync_until_joined(&client, &request, "!r:peer", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(error.is_timeout());

        let syncs = client.syncs.lock().unwrap();
        assert!(syncs.len() <= 3, "too many syncs: {}", syncs.len());
        assert!(syncs.iter().all(|sync| sync.timeout_ms == Some(150)));
    }

    #[test]
    fn test_joined_room_lookup() {
        let response = json!({ "next_batch": "s1", "rooms": { "join": { "!r:peer": { "state": { "events": [] } } } } });

        assert!(joined_room(&response, "!r:peer").is_some());
        assert!(joined_room(&response, "!other:peer").is_none());
    }
}
