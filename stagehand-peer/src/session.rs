//! Partial-state join sessions.
//!
//! A [`JoinSession`] spins up a room on a fresh peer emulator, has a client
//! join it through the server under test, and leaves the server's background
//! resync parked on the emulator's `/state_ids` handler. The test observes the
//! resync request arriving, races client operations against it, and releases
//! the response when it is ready.
//!
//! Teardown happens on drop. Whatever path the test takes out of scope, both
//! gates are finished and the listener is cancelled, so no handler task stays
//! parked waiting for a release that will never come.

use std::time::Duration;

use stagehand_core::client::ClientDriver;
use stagehand_core::room::PeerRoomState;
use stagehand_core::{HarnessConfig, HarnessError, RendezvousGate, Result, TimeoutConfig};

use crate::handlers::{PeerStateHandler, SharedRoom};
use crate::server::{ListenerHandle, PeerServer};

/// A room joined through the server under test whose state resync is held
/// open on the peer emulator.
pub struct JoinSession {
    server: PeerServer,
    listener: Option<ListenerHandle>,
    room: SharedRoom,
    room_id: String,
    state_ids_received: RendezvousGate,
    state_ids_may_respond: RendezvousGate,
    destroyed: bool,
}

impl JoinSession {
    /// Creates a room on a new peer emulator and joins `client` to it.
    ///
    /// The room is created by the first of `seed_members` (localparts on the
    /// peer) and every other seed member joins it. When this returns the join
    /// call has completed, but the resync it triggers is held until
    /// [`release`](JoinSession::release).
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If `seed_members` is empty, the room cannot be
    ///   built, or the join is rejected
    /// - `HarnessError::Timeout` - If the join does not complete in time
    /// - `HarnessError::Io` - If the peer listener cannot bind
    pub async fn begin(
        config: &HarnessConfig,
        client: &dyn ClientDriver,
        seed_members: &[&str],
    ) -> Result<Self> {
        let Some((creator, _)) = seed_members.split_first() else {
            return Err(HarnessError::setup("a session needs at least one seed member"));
        };

        let mut server = PeerServer::bind(config).await?;
        let state_ids_received = RendezvousGate::new("state_ids request received");
        let state_ids_may_respond = RendezvousGate::new("state_ids may respond");

        let room_version = client.default_room_version().await?;
        let members: Vec<String> = seed_members
            .iter()
            .map(|localpart| server.user_id(localpart))
            .collect();
        let room = server.make_room(&room_version, &server.user_id(creator), &members)?;
        let room_id = room.read().room_id().to_string();

        server.handle_state_requests(
            PeerStateHandler::state_ids(room.clone())
                .with_request_received(state_ids_received.clone())
                .with_may_respond(state_ids_may_respond.clone(), config.timeouts.may_respond),
        )?;
        server.handle_state_requests(PeerStateHandler::state(room.clone()))?;

        let listener = server.listen()?;
        // From here on a failed join tears the session down through Drop.
        let session = Self {
            server,
            listener: Some(listener),
            room,
            room_id,
            state_ids_received,
            state_ids_may_respond,
            destroyed: false,
        };

        let via = vec![session.server_name().to_string()];
        let join = tokio::time::timeout(
            config.timeouts.join,
            client.join_room(&session.room_id, &via),
        )
        .await
        .map_err(|_| {
            HarnessError::timeout(
                format!("{} joining {}", client.user_id(), session.room_id),
                config.timeouts.join,
            )
        })?;
        if let Err(e) = join {
            return Err(HarnessError::setup(format!(
                "{} failed to join {}: {e}",
                client.user_id(),
                session.room_id
            )));
        }

        tracing::info!("/join request completed for {} in {}", client.user_id(), session.room_id);
        Ok(session)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Returns the peer emulator's federation server name.
    pub fn server_name(&self) -> &str {
        self.server.server_name()
    }

    /// Returns the ID of a user hosted on the peer emulator.
    pub fn user_id(&self, localpart: &str) -> String {
        self.server.user_id(localpart)
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        self.server.timeouts()
    }

    /// Returns a copy of the emulator's current view of the room.
    pub fn room(&self) -> PeerRoomState {
        self.room.read().clone()
    }

    /// Gate finished when the first `/state_ids` request arrives.
    pub fn request_received_gate(&self) -> &RendezvousGate {
        &self.state_ids_received
    }

    /// Gate holding the `/state_ids` response until finished.
    pub fn may_respond_gate(&self) -> &RendezvousGate {
        &self.state_ids_may_respond
    }

    /// Waits for a `/state_ids` request for the session's room to arrive.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If no request arrived within `timeout`
    pub async fn await_resync_request(&self, timeout: Duration) -> Result<()> {
        self.state_ids_received
            .wait(timeout, "Waiting for /state_ids request")
            .await
    }

    /// Lets the held `/state_ids` response go out, so the resync can finish.
    pub fn release(&self) {
        tracing::info!("Releasing /state_ids response for {}", self.room_id);
        self.state_ids_may_respond.finish();
    }

    /// Returns and clears failures raised on the emulator's handler tasks.
    pub fn handler_failures(&self) -> Vec<HarnessError> {
        self.server.failures().drain()
    }

    /// Number of requests the emulator is handling right now, held ones included.
    pub fn handlers_in_flight(&self) -> usize {
        self.server.in_flight().current()
    }

    /// Waits until the emulator has no request in flight.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If requests are still being handled after `timeout`
    pub async fn await_handlers_idle(&self, timeout: Duration) -> Result<()> {
        self.server.in_flight().await_idle(timeout).await
    }

    /// Releases every gate and cancels the listener.
    ///
    /// Safe to call any number of times, before or after [`release`].
    ///
    /// [`release`]: JoinSession::release
    pub fn destroy(&mut self) {
        self.state_ids_may_respond.finish();
        self.state_ids_received.finish();

        if let Some(listener) = self.listener.as_mut() {
            listener.cancel();
        }
        if !self.destroyed {
            self.destroyed = true;
            tracing::info!("Join session for {} destroyed", self.room_id);
        }
    }

    /// Destroys the session and waits up to `grace` for the listener task to
    /// stop.
    pub async fn shutdown(mut self, grace: Duration) {
        self.destroy();
        if let Some(mut listener) = self.listener.take() {
            listener.shutdown(grace).await;
        }
    }
}

impl Drop for JoinSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use stagehand_core::Probe;
    use stagehand_core::client::SyncRequest;

    use super::*;
    use crate::scenario::{SEED_MEMBERS, begin_seeded, expected_members};

    /// Client whose join succeeds without touching the peer. The tests then
    /// play the server under test themselves with reqwest.
    struct ScriptedClient {
        fail_join: bool,
        joins: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(fail_join: bool) -> Self {
            Self {
                fail_join,
                joins: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ClientDriver for ScriptedClient {
        fn user_id(&self) -> &str {
            "@alice:hs1"
        }

        async fn default_room_version(&self) -> Result<String> {
            Ok("10".to_string())
        }

        async fn join_room(&self, room_id: &str, _via: &[String]) -> Result<String> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            if self.fail_join {
                return Err(HarnessError::UnexpectedStatus {
                    status: 403,
                    body: "forbidden".to_string(),
                });
            }
            Ok(room_id.to_string())
        }

        async fn sync(&self, _request: &SyncRequest) -> Result<Value> {
            Ok(json!({ "next_batch": "s0" }))
        }

        async fn members(&self, _room_id: &str, _at: Option<&str>) -> Result<Value> {
            Ok(json!({ "chunk": [] }))
        }

        async fn room_state(&self, _room_id: &str) -> Result<Value> {
            Ok(json!([]))
        }
    }

    fn state_ids_url(session: &JoinSession) -> String {
        format!(
            "http://{}/_matrix/federation/v1/state_ids/{}?event_id=%24join",
            session.server_name(),
            session.room_id().replace('!', "%21").replace(':', "%3A")
        )
    }

    fn fetch_state_ids(session: &JoinSession) -> Probe<reqwest::Result<u16>> {
        let url = state_ids_url(session);
        Probe::spawn("state_ids fetch", async move {
            let response = reqwest::get(url).await?;
            Ok(response.status().as_u16())
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_begin_seeds_room_and_joins() {
        let client = ScriptedClient::new(false);
        let session = JoinSession::begin(&HarnessConfig::for_testing(), &client, &["charlie", "derek"])
            .await
            .unwrap();

        assert_eq!(client.joins.load(Ordering::SeqCst), 1);
        let room = session.room();
        assert_eq!(
            room.joined_members(),
            vec![session.user_id("charlie"), session.user_id("derek")]
        );
        assert!(!session.request_received_gate().is_finished());
        assert!(!session.may_respond_gate().is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_ids_held_until_release() {
        let client = ScriptedClient::new(false);
        let session = JoinSession::begin(&HarnessConfig::for_testing(), &client, &["charlie", "derek"])
            .await
            .unwrap();

        let mut fetch = fetch_state_ids(&session);
        session
            .await_resync_request(Duration::from_secs(5))
            .await
            .unwrap();
        fetch.assert_pending().unwrap();

        session.release();
        let status = fetch
            .await_within(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, 200);
        assert!(session.handler_failures().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_destroy_releases_parked_handler() {
        let client = ScriptedClient::new(false);
        let mut session =
            JoinSession::begin(&HarnessConfig::for_testing(), &client, &["charlie"])
                .await
                .unwrap();

        let mut fetch = fetch_state_ids(&session);
        session
            .await_resync_request(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.handlers_in_flight(), 1);

        session.destroy();
        session.destroy();

        session
            .await_handlers_idle(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.handlers_in_flight(), 0);
        let status = fetch
            .await_within(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, 200);
        assert!(session.may_respond_gate().is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_seeded_session_expects_seed_members_and_joiner() {
        let client = ScriptedClient::new(false);
        let session = begin_seeded(&HarnessConfig::for_testing(), &client)
            .await
            .unwrap();

        let expected = expected_members(&session, client.user_id());
        assert_eq!(expected.len(), SEED_MEMBERS.len() + 1);
        assert!(expected.contains("@alice:hs1"));
        // The scripted join never reaches the peer, so only the seed is in the room
        let seeded: BTreeSet<String> = session.room().joined_members().into_iter().collect();
        assert_eq!(seeded.len(), SEED_MEMBERS.len());
        assert!(seeded.is_subset(&expected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_join_surfaces_setup_error() {
        let client = ScriptedClient::new(true);
        let error = JoinSession::begin(&HarnessConfig::for_testing(), &client, &["charlie"])
            .await
            .err()
            .expect("join failure must abort the session");

        assert!(matches!(error, HarnessError::Setup { .. }));
        assert!(error.to_string().contains("403"));
    }

    #[tokio::test]
    async fn test_begin_requires_seed_member() {
        let client = ScriptedClient::new(false);
        let error = JoinSession::begin(&HarnessConfig::for_testing(), &client, &[])
            .await
            .err()
            .expect("empty seed must be rejected");

        assert!(matches!(error, HarnessError::Setup { .. }));
        assert_eq!(client.joins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_listener() {
        let client = ScriptedClient::new(false);
        let session = JoinSession::begin(&HarnessConfig::for_testing(), &client, &["charlie"])
            .await
            .unwrap();
        let url = state_ids_url(&session);

        session.shutdown(Duration::from_secs(1)).await;

        let refused = reqwest::Client::new()
            .get(url)
            .timeout(Duration::from_secs(1))
            .send()
            .await;
        assert!(refused.is_err());
    }
}
