//! Scenario runners.
//!
//! Every scenario joins alice on the simulated homeserver to a room the peer
//! emulator seeded with charlie and derek, with the resync held on the peer.

use std::time::Duration;

use anyhow::{Context, ensure};
use serde_json::Value;
use stagehand_core::client::{joined_room, joined_user_ids, room_section_members};
use stagehand_core::{ClientDriver, HarnessConfig, HttpClientDriver, Probe, SyncRequest, sync_until_joined};
use stagehand_peer::JoinSession;
use stagehand_peer::scenario::{SEED_MEMBERS, SETTLE, begin_seeded, expected_members};
use stagehand_sim::SimHomeserver;

/// Scenarios the CLI can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    SyncBlocks,
    LazySync,
    MembersBlocks,
    StateBlocks,
    Teardown,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::SyncBlocks,
        Scenario::LazySync,
        Scenario::MembersBlocks,
        Scenario::StateBlocks,
        Scenario::Teardown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::SyncBlocks => "sync-blocks",
            Scenario::LazySync => "lazy-sync",
            Scenario::MembersBlocks => "members-blocks",
            Scenario::StateBlocks => "state-blocks",
            Scenario::Teardown => "teardown",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Scenario::SyncBlocks => "a plain sync waits for the resync to finish",
            Scenario::LazySync => "a lazy-loading sync returns while the resync is held",
            Scenario::MembersBlocks => "/members?at= waits for the resync to finish",
            Scenario::StateBlocks => "/state waits for the resync to finish",
            Scenario::Teardown => "destroying a held session releases the peer handler",
        }
    }
}

/// Runs `scenario` against a freshly spawned simulated homeserver.
///
/// # Errors
///
/// Returns the first failed expectation or harness error
pub async fn run(scenario: Scenario, config: &HarnessConfig) -> anyhow::Result<()> {
    let homeserver = SimHomeserver::spawn(&config.homeserver).await?;
    let alice = homeserver.register_user("alice")?;
    tracing::info!("Running scenario {}", scenario.name());

    let outcome = match scenario {
        Scenario::SyncBlocks => sync_blocks(config, &alice).await,
        Scenario::LazySync => lazy_sync(config, &homeserver, &alice).await,
        Scenario::MembersBlocks => members_blocks(config, &alice).await,
        Scenario::StateBlocks => state_blocks(config, &alice).await,
        Scenario::Teardown => teardown(config, &alice).await,
    };

    homeserver.shutdown(Duration::from_secs(1)).await;
    outcome
}

/// Races `probe` against the held resync: it must still be pending while the
/// response is held and finish within the probe bound once released.
async fn race_release<T: Send + 'static>(
    config: &HarnessConfig,
    session: &JoinSession,
    mut probe: Probe<T>,
) -> anyhow::Result<T> {
    tokio::time::sleep(SETTLE).await;
    probe.assert_pending()?;

    session.release();
    Ok(probe.await_within(config.timeouts.probe_completion).await?)
}

async fn sync_blocks(config: &HarnessConfig, alice: &HttpClientDriver) -> anyhow::Result<()> {
    let session = begin_seeded(config, alice).await?;
    session
        .await_resync_request(config.timeouts.request_received)
        .await?;

    let client = alice.clone();
    let probe = Probe::spawn("sync during partial-state join", async move {
        client.sync(&SyncRequest::default()).await
    });
    let response = race_release(config, &session, probe).await??;

    let room = joined_room(&response, session.room_id()).context("joined room missing from sync")?;
    let members = room_section_members(room);
    for localpart in SEED_MEMBERS {
        let user_id = session.user_id(localpart);
        ensure!(members.contains(&user_id), "sync lacks membership of {user_id}");
    }
    Ok(())
}

async fn lazy_sync(
    config: &HarnessConfig,
    homeserver: &SimHomeserver,
    alice: &HttpClientDriver,
) -> anyhow::Result<()> {
    let session = begin_seeded(config, alice).await?;

    sync_until_joined(
        alice,
        &SyncRequest::lazy_loading(),
        session.room_id(),
        config.timeouts.request_received,
    )
    .await?;

    ensure!(
        !session.may_respond_gate().is_finished(),
        "resync was released before the lazy-loading sync returned"
    );
    ensure!(
        homeserver.is_partial_state(session.room_id()) == Some(true),
        "room left partial state while the resync was held"
    );
    Ok(())
}

async fn members_blocks(config: &HarnessConfig, alice: &HttpClientDriver) -> anyhow::Result<()> {
    let session = begin_seeded(config, alice).await?;
    session
        .await_resync_request(config.timeouts.request_received)
        .await?;

    let token = sync_until_joined(
        alice,
        &SyncRequest::lazy_loading(),
        session.room_id(),
        config.timeouts.request_received,
    )
    .await?;

    let client = alice.clone();
    let room_id = session.room_id().to_string();
    let probe = Probe::spawn("members at sync token", async move {
        client.members(&room_id, Some(&token)).await
    });
    let response = race_release(config, &session, probe).await??;

    let chunk = response
        .get("chunk")
        .and_then(Value::as_array)
        .context("members response has no chunk")?;
    let members = joined_user_ids(chunk);
    ensure!(
        members == expected_members(&session, alice.user_id()),
        "unexpected members: {members:?}"
    );
    Ok(())
}

async fn state_blocks(config: &HarnessConfig, alice: &HttpClientDriver) -> anyhow::Result<()> {
    let session = begin_seeded(config, alice).await?;
    session
        .await_resync_request(config.timeouts.request_received)
        .await?;

    let client = alice.clone();
    let room_id = session.room_id().to_string();
    let probe = Probe::spawn("room state", async move { client.room_state(&room_id).await });
    let response = race_release(config, &session, probe).await??;

    let events = response.as_array().context("state response is not an array")?;
    let members = joined_user_ids(events);
    ensure!(
        members == expected_members(&session, alice.user_id()),
        "unexpected members: {members:?}"
    );
    Ok(())
}

async fn teardown(config: &HarnessConfig, alice: &HttpClientDriver) -> anyhow::Result<()> {
    let mut session = begin_seeded(config, alice).await?;
    session
        .await_resync_request(config.timeouts.request_received)
        .await?;

    session.destroy();
    session
        .await_handlers_idle(config.timeouts.probe_completion)
        .await?;

    let failures = session.handler_failures();
    ensure!(failures.is_empty(), "peer handlers failed: {failures:?}");
    Ok(())
}
