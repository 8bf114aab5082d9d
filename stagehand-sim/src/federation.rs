//! Outbound federation requests made by the simulated homeserver.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use stagehand_core::room::Pdu;

use crate::error::HomeserverError;

/// `make_join` response: the join event template to fill in.
#[derive(Debug, Clone, Deserialize)]
pub struct MakeJoinResponse {
    pub room_version: String,
    pub event: Pdu,
}

/// `send_join` (v2) response.
#[derive(Debug, Clone, Deserialize)]
pub struct SendJoinResponse {
    #[serde(default)]
    pub state: Vec<Pdu>,
    #[serde(default)]
    pub auth_chain: Vec<Pdu>,
    #[serde(default)]
    pub members_omitted: bool,
    #[serde(default)]
    pub servers_in_room: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateIds {
    pub auth_chain_ids: Vec<String>,
    pub pdu_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomStateSnapshot {
    pub auth_chain: Vec<Pdu>,
    pub pdus: Vec<Pdu>,
}

/// Plain-HTTP federation client. Remote server names are `host:port`.
#[derive(Clone)]
pub struct FederationClient {
    http: reqwest::Client,
}

impl FederationClient {
    /// Creates a client whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// - `HomeserverError::Http` - If the HTTP client cannot be built
    pub fn new(timeout: Duration) -> Result<Self, HomeserverError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    fn url(server: &str, path: &str) -> String {
        format!("http://{server}/_matrix/{path}")
    }

    pub async fn make_join(
        &self,
        server: &str,
        room_id: &str,
        user_id: &str,
        supported_version: &str,
    ) -> Result<MakeJoinResponse, HomeserverError> {
        let url = Self::url(
            server,
            &format!(
                "federation/v1/make_join/{}/{}",
                urlencoding::encode(room_id),
                urlencoding::encode(user_id)
            ),
        );
        self.fetch(server, self.http.get(url).query(&[("ver", supported_version)]))
            .await
    }

    pub async fn send_join(&self, server: &str, event: &Pdu) -> Result<SendJoinResponse, HomeserverError> {
        let url = Self::url(
            server,
            &format!(
                "federation/v2/send_join/{}/{}",
                urlencoding::encode(&event.room_id),
                urlencoding::encode(&event.event_id)
            ),
        );
        self.fetch(server, self.http.put(url).json(event)).await
    }

    pub async fn state_ids(
        &self,
        server: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<StateIds, HomeserverError> {
        let url = Self::url(
            server,
            &format!("federation/v1/state_ids/{}", urlencoding::encode(room_id)),
        );
        self.fetch(server, self.http.get(url).query(&[("event_id", event_id)]))
            .await
    }

    pub async fn state(
        &self,
        server: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<RoomStateSnapshot, HomeserverError> {
        let url = Self::url(
            server,
            &format!("federation/v1/state/{}", urlencoding::encode(room_id)),
        );
        self.fetch(server, self.http.get(url).query(&[("event_id", event_id)]))
            .await
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        server: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, HomeserverError> {
        let response = request
            .send()
            .await
            .map_err(|e| HomeserverError::federation(server, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HomeserverError::federation(
                server,
                format!("HTTP {status}: {body}"),
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| HomeserverError::federation(server, e))
    }
}
