//! Peer emulator HTTP server.
//!
//! Binds a local listener that the server under test treats as a remote
//! federation participant. Rooms and state handlers are registered on the
//! shared [`PeerState`]; the router is fixed and dispatches by room ID, so
//! handlers can be installed before or after the listener starts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, put};
use parking_lot::{Mutex, RwLock};
use stagehand_core::room::{PeerRoomState, RoomIdGenerator};
use stagehand_core::{HarnessConfig, HarnessError, Result, TimeoutConfig};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::federation;
use crate::handlers::{PeerStateHandler, SharedRoom, StateEndpoint};

/// Collects errors raised on handler tasks.
///
/// Handler tasks cannot fail the test directly, so they record failures here
/// and the test drains them at checkpoints or teardown.
#[derive(Clone, Default)]
pub struct FailureSink {
    failures: Arc<Mutex<Vec<HarnessError>>>,
}

impl FailureSink {
    /// Records a failure and logs it.
    pub fn record(&self, failure: HarnessError) {
        tracing::error!("Peer handler failure: {failure}");
        self.failures.lock().push(failure);
    }

    /// Removes and returns all recorded failures.
    pub fn drain(&self) -> Vec<HarnessError> {
        std::mem::take(&mut *self.failures.lock())
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts peer requests currently being handled.
#[derive(Clone)]
pub struct InFlightRequests {
    count: Arc<watch::Sender<usize>>,
}

impl Default for InFlightRequests {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }
}

impl InFlightRequests {
    /// Marks a request as started until the returned guard is dropped.
    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until no request is in flight.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If requests were still in flight after `timeout`
    pub async fn await_idle(&self, timeout: Duration) -> Result<()> {
        let mut receiver = self.count.subscribe();
        let idle = tokio::time::timeout(timeout, receiver.wait_for(|count| *count == 0))
            .await
            .map(|changed| changed.map(|_| ()));
        match idle {
            Ok(Ok(())) => Ok(()),
            _ => Err(HarnessError::timeout(
                format!("Waiting for {} peer request(s) to finish", self.current()),
                timeout,
            )),
        }
    }
}

/// Decrements the in-flight count on drop, including when the request
/// future is cancelled.
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// State shared by every route of the emulator.
#[derive(Clone)]
pub struct PeerState {
    pub(crate) server_name: String,
    pub(crate) rooms: Arc<RwLock<HashMap<String, SharedRoom>>>,
    pub(crate) state_handlers: Arc<RwLock<HashMap<(StateEndpoint, String), PeerStateHandler>>>,
    pub(crate) failures: FailureSink,
    pub(crate) in_flight: InFlightRequests,
}

impl PeerState {
    pub(crate) fn room(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.read().get(room_id).cloned()
    }

    pub(crate) fn state_handler(
        &self,
        endpoint: StateEndpoint,
        room_id: &str,
    ) -> Option<PeerStateHandler> {
        self.state_handlers
            .read()
            .get(&(endpoint, room_id.to_string()))
            .cloned()
    }
}

/// Handle to a running listener. Cancelling stops new connections; requests
/// already being served run to completion.
pub struct ListenerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Signals the listener to stop. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            tracing::debug!("Peer listener cancelled");
        }
    }

    /// Cancels the listener and waits up to `grace` for it to wind down,
    /// aborting it afterwards.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.cancel();
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(grace, &mut task).await.is_err()
        {
            tracing::warn!("Peer listener did not stop within {grace:?}, aborting");
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Federation peer emulator.
pub struct PeerServer {
    state: PeerState,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    room_ids: Mutex<RoomIdGenerator>,
    timeouts: TimeoutConfig,
}

impl PeerServer {
    /// Binds the emulator's listener. Nothing is served until [`listen`].
    ///
    /// [`listen`]: PeerServer::listen
    ///
    /// # Errors
    ///
    /// - `HarnessError::Io` - If the listener cannot bind to the configured address
    pub async fn bind(config: &HarnessConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.peer.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let server_name = local_addr.to_string();
        tracing::info!("Peer emulator bound as {server_name}");

        Ok(Self {
            state: PeerState {
                server_name,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                state_handlers: Arc::new(RwLock::new(HashMap::new())),
                failures: FailureSink::default(),
                in_flight: InFlightRequests::default(),
            },
            listener: Some(listener),
            local_addr,
            room_ids: Mutex::new(RoomIdGenerator::new(config.peer.room_seed)),
            timeouts: config.timeouts.clone(),
        })
    }

    /// Returns the federation server name, `host:port` of the listener.
    pub fn server_name(&self) -> &str {
        &self.state.server_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.state.server_name)
    }

    /// Returns the fully qualified ID of a user hosted on this peer.
    pub fn user_id(&self, localpart: &str) -> String {
        format!("@{localpart}:{}", self.state.server_name)
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn failures(&self) -> &FailureSink {
        &self.state.failures
    }

    pub fn in_flight(&self) -> &InFlightRequests {
        &self.state.in_flight
    }

    /// Creates a room owned by this peer with `creator` and `members` joined.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If the room cannot be built consistently
    pub fn make_room(&self, version: &str, creator: &str, members: &[String]) -> Result<SharedRoom> {
        let room_id = self.room_ids.lock().next_room_id(&self.state.server_name);
        let room = PeerRoomState::build(room_id.clone(), version, creator, members)?;
        let room = Arc::new(RwLock::new(room));

        self.state.rooms.write().insert(room_id.clone(), room.clone());
        tracing::info!(
            "Created room {room_id} (version {version}) with {} member(s)",
            members.len()
        );
        Ok(room)
    }

    /// Installs `handler` for its endpoint and room.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If a handler is already installed for the
    ///   same endpoint and room
    pub fn handle_state_requests(&self, handler: PeerStateHandler) -> Result<()> {
        let key = (handler.endpoint(), handler.room_id());
        let mut handlers = self.state.state_handlers.write();
        if handlers.contains_key(&key) {
            return Err(HarnessError::setup(format!(
                "{} handler already installed for room {}",
                key.0, key.1
            )));
        }
        tracing::debug!("Installed {} handler for room {}", key.0, key.1);
        handlers.insert(key, handler);
        Ok(())
    }

    /// Builds the emulator's router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/_matrix/key/v2/server", get(federation::server_keys))
            .route(
                "/_matrix/federation/v1/make_join/{room_id}/{user_id}",
                get(federation::make_join),
            )
            .route(
                "/_matrix/federation/v2/send_join/{room_id}/{event_id}",
                put(federation::send_join),
            )
            .route(
                "/_matrix/federation/v1/event/{event_id}",
                get(federation::event),
            )
            .route(
                "/_matrix/federation/v1/state_ids/{room_id}",
                get(federation::state_ids),
            )
            .route(
                "/_matrix/federation/v1/state/{room_id}",
                get(federation::state),
            )
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                track_in_flight,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Starts serving on the bound listener.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Setup` - If the listener was already started
    pub fn listen(&mut self) -> Result<ListenerHandle> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| HarnessError::setup("peer listener already started"))?;
        let app = self.router();
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let server_name = self.state.server_name.clone();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_signal.await;
                })
                .await;
            match served {
                Ok(()) => tracing::info!("Peer emulator {server_name} stopped"),
                Err(e) => tracing::error!("Peer emulator {server_name} failed: {e}"),
            }
        });

        tracing::info!("Peer emulator listening on {}", self.local_addr);
        Ok(ListenerHandle {
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }
}

async fn track_in_flight(State(state): State<PeerState>, request: Request, next: Next) -> Response {
    let _guard = state.in_flight.enter();
    next.run(request).await
}
