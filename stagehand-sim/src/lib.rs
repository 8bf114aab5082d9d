//! Stagehand Sim - simulated homeserver
//!
//! A small in-memory client-facing server that joins rooms over federation
//! with partial state, resyncs in the background and blocks state-dependent
//! client operations until the resync completes. It stands in for the real
//! server under test so the harness can be exercised end to end.

mod api;
pub mod error;
pub mod federation;
mod partial_join;
pub mod rooms;
pub mod server;

pub use error::HomeserverError;
pub use rooms::{RoomStore, SimRoom, parse_sync_token, sync_token};
pub use server::SimHomeserver;
