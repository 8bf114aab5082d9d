//! Integration tests for Stagehand
//!
//! Each test joins a user on the simulated homeserver to a room hosted by the
//! peer emulator, holds the resulting resync on the peer, and checks which
//! client operations block on it.

#[path = "integration/harness.rs"]
mod harness;

#[path = "integration/partial_state_join.rs"]
mod partial_state_join;

#[path = "integration/session_teardown.rs"]
mod session_teardown;
