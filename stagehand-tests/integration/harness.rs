//! Shared setup for the integration tests.

use std::collections::BTreeSet;

use stagehand_core::tracing_setup::init_test_tracing;
use stagehand_core::{ClientDriver, HarnessConfig, HttpClientDriver};
use stagehand_peer::JoinSession;
use stagehand_peer::scenario::{begin_seeded, expected_members};
use stagehand_sim::SimHomeserver;

pub use stagehand_peer::scenario::{SEED_MEMBERS, SETTLE};

/// A simulated homeserver with alice registered on it.
pub struct Harness {
    pub config: HarnessConfig,
    pub homeserver: SimHomeserver,
    pub alice: HttpClientDriver,
}

impl Harness {
    pub async fn start() -> anyhow::Result<Self> {
        init_test_tracing();
        let config = HarnessConfig::for_testing();
        let homeserver = SimHomeserver::spawn(&config.homeserver).await?;
        let alice = homeserver.register_user("alice")?;
        tracing::debug!(
            "Test homeserver {} ready at {}",
            homeserver.server_name(),
            homeserver.base_url()
        );

        Ok(Self {
            config,
            homeserver,
            alice,
        })
    }

    /// Joins alice to a room seeded with charlie and derek.
    pub async fn begin_session(&self) -> anyhow::Result<JoinSession> {
        Ok(begin_seeded(&self.config, &self.alice).await?)
    }

    /// Membership expected once the resync has completed.
    pub fn expected_members(&self, session: &JoinSession) -> BTreeSet<String> {
        expected_members(session, self.alice.user_id())
    }
}
