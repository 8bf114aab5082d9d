//! Stagehand Peer - federation peer emulator
//!
//! Hosts rooms on a local HTTP listener that the server under test federates
//! with. State endpoints can be gated so a resync stays in flight until the
//! test releases it; [`JoinSession`] wires that up for a single joined room.

mod federation;
pub mod handlers;
pub mod scenario;
pub mod server;
pub mod session;

pub use handlers::{PeerStateHandler, SharedRoom, StateEndpoint, StateReply};
pub use server::{FailureSink, InFlightRequests, ListenerHandle, PeerServer};
pub use session::JoinSession;
