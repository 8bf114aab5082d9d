//! Fixtures shared by the partial-state join scenarios.

use std::collections::BTreeSet;
use std::time::Duration;

use stagehand_core::{ClientDriver, HarnessConfig, Result};

use crate::session::JoinSession;

/// Peer users already in the room before the joining user arrives.
pub const SEED_MEMBERS: [&str; 2] = ["charlie", "derek"];

/// Time a probe gets to reach the server before it is checked for blocking.
pub const SETTLE: Duration = Duration::from_millis(200);

/// Joins `client` to a room the peer seeded with [`SEED_MEMBERS`].
///
/// # Errors
///
/// Any error from [`JoinSession::begin`]
pub async fn begin_seeded(
    config: &HarnessConfig,
    client: &dyn ClientDriver,
) -> Result<JoinSession> {
    JoinSession::begin(config, client, &SEED_MEMBERS).await
}

/// Membership of a seeded room once the resync has completed.
pub fn expected_members(session: &JoinSession, joining_user: &str) -> BTreeSet<String> {
    SEED_MEMBERS
        .iter()
        .map(|localpart| session.user_id(localpart))
        .chain(std::iter::once(joining_user.to_string()))
        .collect()
}
