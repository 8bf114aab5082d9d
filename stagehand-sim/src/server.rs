//! Simulated homeserver lifecycle and routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use parking_lot::{Mutex, RwLock};
use stagehand_core::{HomeserverConfig, HttpClientDriver};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::error::HomeserverError;
use crate::federation::FederationClient;
use crate::rooms::RoomStore;

/// User an access token was issued to, attached to authenticated requests.
#[derive(Debug, Clone)]
pub(crate) struct AuthenticatedUser(pub(crate) String);

/// State shared by the client API routes and resync tasks.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) server_name: String,
    pub(crate) default_room_version: String,
    pub(crate) partial_state_timeout: Duration,
    pub(crate) tokens: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) rooms: RoomStore,
    pub(crate) federation: FederationClient,
    pub(crate) resyncs: ResyncTasks,
}

/// Background resync tasks still running, aborted when the server stops.
#[derive(Clone, Default)]
pub(crate) struct ResyncTasks(Arc<Mutex<Vec<JoinHandle<()>>>>);

impl ResyncTasks {
    /// Tracks `task`, dropping handles of resyncs that already finished.
    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.0.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        tracing::debug!("{} resync task(s) running", tasks.len());
    }

    fn abort_all(&self) {
        for task in self.0.lock().drain(..) {
            task.abort();
        }
    }
}

/// In-memory homeserver serving the client API on a local port.
///
/// Joins go out over federation to whatever server the client names, so
/// pointing a join at the peer emulator exercises a real partial-state join.
pub struct SimHomeserver {
    state: AppState,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SimHomeserver {
    /// Binds the client API and starts serving it.
    ///
    /// # Errors
    ///
    /// - `HomeserverError::Io` - If the listener cannot bind
    /// - `HomeserverError::Http` - If the federation client cannot be built
    pub async fn spawn(config: &HomeserverConfig) -> Result<Self, HomeserverError> {
        let state = AppState {
            server_name: config.server_name.clone(),
            default_room_version: config.default_room_version.clone(),
            partial_state_timeout: config.federation_timeout,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            rooms: RoomStore::default(),
            federation: FederationClient::new(config.federation_timeout)?,
            resyncs: ResyncTasks::default(),
        };

        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let app = router(state.clone());
        let (shutdown, shutdown_signal) = oneshot::channel::<()>();

        let server_name = state.server_name.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_signal.await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!("Homeserver {server_name} failed: {e}");
            }
        });
        tracing::info!(
            "Simulated homeserver {} listening on {local_addr}",
            state.server_name
        );

        Ok(Self {
            state,
            local_addr,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.state.server_name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Returns a fully qualified ID for a user on this server.
    pub fn user_id(&self, localpart: &str) -> String {
        format!("@{localpart}:{}", self.state.server_name)
    }

    /// Registers a user and returns a client driver logged in as them.
    ///
    /// # Errors
    ///
    /// - `HomeserverError::Room` - If the driver cannot be created for the base URL
    pub fn register_user(&self, localpart: &str) -> Result<HttpClientDriver, HomeserverError> {
        let user_id = self.user_id(localpart);
        let access_token = uuid::Uuid::new_v4().simple().to_string();
        self.state
            .tokens
            .write()
            .insert(access_token.clone(), user_id.clone());
        tracing::debug!("Registered {user_id}");

        Ok(HttpClientDriver::new(&self.base_url(), user_id, access_token)?)
    }

    /// Returns whether `room_id` is still waiting on a state resync, or
    /// `None` if the server has not joined it.
    pub fn is_partial_state(&self, room_id: &str) -> Option<bool> {
        self.state.rooms.room(room_id).map(|room| room.is_partial_state())
    }

    /// Stops serving and aborts outstanding resyncs, waiting up to `grace`
    /// for the listener task.
    pub async fn shutdown(mut self, grace: Duration) {
        self.stop();
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(grace, &mut task).await.is_err()
        {
            tracing::warn!("Homeserver did not stop within {grace:?}, aborting");
            task.abort();
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            tracing::info!("Simulated homeserver {} stopping", self.state.server_name);
        }
        self.state.resyncs.abort_all();
    }
}

impl Drop for SimHomeserver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the client API router over `state`.
pub(crate) fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/_matrix/client/r0/capabilities", get(api::capabilities))
        .route("/_matrix/client/r0/join/{room_id}", post(api::join))
        .route("/_matrix/client/r0/sync", get(api::sync))
        .route("/_matrix/client/r0/rooms/{room_id}/members", get(api::members))
        .route("/_matrix/client/r0/rooms/{room_id}/state", get(api::room_state))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_access_token,
        ));

    authenticated
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_access_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, HomeserverError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(HomeserverError::MissingToken)?;
    let user_id = state
        .tokens
        .read()
        .get(token)
        .cloned()
        .ok_or(HomeserverError::UnknownToken)?;

    request.extensions_mut().insert(AuthenticatedUser(user_id));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use stagehand_core::{ClientDriver, HarnessConfig};
    use tower::ServiceExt;

    use super::*;

    async fn test_homeserver() -> SimHomeserver {
        SimHomeserver::spawn(&HarnessConfig::for_testing().homeserver)
            .await
            .unwrap()
    }

    fn with_token(homeserver: &SimHomeserver, user_id: &str) -> String {
        let token = "test-token".to_string();
        homeserver
            .state
            .tokens
            .write()
            .insert(token.clone(), user_id.to_string());
        token
    }

    #[tokio::test]
    async fn test_finished_resyncs_are_pruned() {
        let resyncs = ResyncTasks::default();
        let finished = tokio::spawn(async {});
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }
        resyncs.track(finished);

        let running = tokio::spawn(std::future::pending::<()>());
        resyncs.track(running);
        assert_eq!(resyncs.0.lock().len(), 1);

        resyncs.abort_all();
        assert!(resyncs.0.lock().is_empty());
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_requests_without_token_rejected() {
        let homeserver = test_homeserver().await;

        let response = router(homeserver.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/_matrix/client/r0/sync")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["errcode"], "M_MISSING_TOKEN");
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let homeserver = test_homeserver().await;

        let response = router(homeserver.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/_matrix/client/r0/capabilities")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["errcode"], "M_UNKNOWN_TOKEN");
    }

    #[tokio::test]
    async fn test_empty_sync_returns_token() {
        let homeserver = test_homeserver().await;
        let token = with_token(&homeserver, "@alice:hs1");

        let response = router(homeserver.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/_matrix/client/r0/sync")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["next_batch"], "s0");
        assert!(body["rooms"]["join"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_members_of_unknown_room_is_not_found() {
        let homeserver = test_homeserver().await;
        let token = with_token(&homeserver, "@alice:hs1");

        let response = router(homeserver.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/_matrix/client/r0/rooms/%21nowhere%3Apeer/members")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_registered_driver_reads_capabilities() {
        let homeserver = test_homeserver().await;
        let alice = homeserver.register_user("alice").unwrap();

        assert_eq!(alice.user_id(), "@alice:hs1");
        assert_eq!(alice.default_room_version().await.unwrap(), "10");
        homeserver.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_join_without_reachable_server_fails() {
        let homeserver = test_homeserver().await;
        let alice = homeserver.register_user("alice").unwrap();

        let error = alice
            .join_room("!room:127.0.0.1:9", &["127.0.0.1:9".to_string()])
            .await
            .unwrap_err();

        assert!(error.to_string().contains("502"));
        assert_eq!(homeserver.is_partial_state("!room:127.0.0.1:9"), None);
    }
}
