//! Stagehand Core - building blocks for partial-state join tests
//!
//! Provides the one-shot rendezvous gate that holds peer responses open, the
//! room model served by the peer emulator, concurrent probes for racing client
//! operations against gate releases, and the client driver seam used to talk
//! to the server under test.

pub mod client;
pub mod config;
pub mod error;
pub mod gate;
pub mod probe;
pub mod room;
pub mod tracing_setup;

pub use client::{
    ClientDriver, HttpClientDriver, SyncRequest, build_lazy_loading_sync_filter, sync_until_joined,
};
pub use config::{HarnessConfig, HomeserverConfig, PeerConfig, TimeoutConfig};
pub use error::{HarnessError, Result};
pub use gate::RendezvousGate;
pub use probe::Probe;
pub use room::{EventSpec, Pdu, PeerRoomState, RoomIdGenerator};
