//! Errors returned by the simulated homeserver's client API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use stagehand_core::HarnessError;

/// Client API errors, rendered as Matrix `{"errcode", "error"}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum HomeserverError {
    #[error("Missing access token")]
    MissingToken,

    #[error("Unrecognised access token")]
    UnknownToken,

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: String },

    #[error("{user_id} is not joined to {room_id}")]
    NotJoined { user_id: String, room_id: String },

    #[error("Invalid parameter: {reason}")]
    InvalidParam { reason: String },

    #[error("Federation request to {server} failed: {reason}")]
    Federation { server: String, reason: String },

    #[error("Timed out waiting for full state of {room_id}")]
    PartialStateTimeout { room_id: String },

    #[error("Room error: {0}")]
    Room(#[from] HarnessError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HomeserverError {
    pub fn invalid_param(reason: impl std::fmt::Display) -> Self {
        HomeserverError::InvalidParam {
            reason: reason.to_string(),
        }
    }

    pub fn federation(server: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        HomeserverError::Federation {
            server: server.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the HTTP status the error is served with.
    pub fn status(&self) -> StatusCode {
        match self {
            HomeserverError::MissingToken | HomeserverError::UnknownToken => StatusCode::UNAUTHORIZED,
            HomeserverError::RoomNotFound { .. } => StatusCode::NOT_FOUND,
            HomeserverError::NotJoined { .. } => StatusCode::FORBIDDEN,
            HomeserverError::InvalidParam { .. } => StatusCode::BAD_REQUEST,
            HomeserverError::Federation { .. } | HomeserverError::Http(_) => StatusCode::BAD_GATEWAY,
            HomeserverError::PartialStateTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            HomeserverError::Room(_) | HomeserverError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the Matrix error code.
    pub fn errcode(&self) -> &'static str {
        match self {
            HomeserverError::MissingToken => "M_MISSING_TOKEN",
            HomeserverError::UnknownToken => "M_UNKNOWN_TOKEN",
            HomeserverError::RoomNotFound { .. } => "M_NOT_FOUND",
            HomeserverError::NotJoined { .. } => "M_FORBIDDEN",
            HomeserverError::InvalidParam { .. } => "M_INVALID_PARAM",
            _ => "M_UNKNOWN",
        }
    }
}

impl IntoResponse for HomeserverError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Client request failed: {self}");
        } else {
            tracing::debug!("Client request rejected: {self}");
        }

        (
            status,
            Json(json!({ "errcode": self.errcode(), "error": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn test_error_body_is_matrix_shaped() {
        let response = HomeserverError::RoomNotFound {
            room_id: "!missing:peer".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errcode"], "M_NOT_FOUND");
        assert!(body["error"].as_str().unwrap().contains("!missing:peer"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(HomeserverError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            HomeserverError::federation("peer", "refused").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HomeserverError::PartialStateTimeout {
                room_id: "!r:peer".to_string()
            }
            .errcode(),
            "M_UNKNOWN"
        );
        assert_eq!(HomeserverError::invalid_param("bad token").errcode(), "M_INVALID_PARAM");
    }
}
