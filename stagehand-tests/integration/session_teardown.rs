//! Teardown of sessions whose resync was never released.

use std::time::{Duration, Instant};

use futures::FutureExt;
use stagehand_core::RendezvousGate;
use tokio::sync::oneshot;

use crate::harness::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_immediately_after_begin() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let mut session = harness.begin_session().await?;

    let started = Instant::now();
    session.destroy();
    session
        .await_handlers_idle(harness.config.timeouts.probe_completion)
        .await?;

    assert!(session.request_received_gate().is_finished());
    assert!(session.may_respond_gate().is_finished());
    assert!(started.elapsed() < harness.config.timeouts.may_respond);
    assert!(session.handler_failures().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destroy_releases_held_resync_request() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let mut session = harness.begin_session().await?;
    session
        .await_resync_request(harness.config.timeouts.request_received)
        .await?;
    assert!(
        session.handlers_in_flight() >= 1,
        "/state_ids handler should be held before teardown"
    );
    assert!(!session.may_respond_gate().is_finished());

    session.destroy();
    session
        .await_handlers_idle(harness.config.timeouts.probe_completion)
        .await?;

    assert!(session.handler_failures().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_destroy_and_shutdown() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let mut session = harness.begin_session().await?;
    session
        .await_resync_request(harness.config.timeouts.request_received)
        .await?;

    session.release();
    session.destroy();
    session.destroy();
    session.shutdown(Duration::from_secs(1)).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_test_body_still_tears_down() -> anyhow::Result<()> {
    let harness = Harness::start().await?;
    let (gate_sender, gate_receiver) = oneshot::channel::<RendezvousGate>();

    let body = async {
        let session = harness.begin_session().await?;
        session
            .await_resync_request(harness.config.timeouts.request_received)
            .await?;
        let _ = gate_sender.send(session.may_respond_gate().clone());

        let members = session.room().joined_members();
        assert!(members.is_empty(), "deliberate failure with {members:?}");
        anyhow::Ok(())
    };
    let outcome = std::panic::AssertUnwindSafe(body).catch_unwind().await;
    assert!(outcome.is_err(), "test body was expected to panic");

    let may_respond = gate_receiver.await?;
    assert!(may_respond.is_finished());
    Ok(())
}
