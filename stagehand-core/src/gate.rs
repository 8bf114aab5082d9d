//! One-shot rendezvous gate shared between a test and peer handler tasks.
//!
//! A gate starts open and is finished at most once. Waiters registered before
//! or after the finish are all released; finishing again is a no-op. Cloning a
//! gate yields another handle to the same underlying state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{HarnessError, Result};

/// Single-shot, multi-waiter synchronization gate.
///
/// Built on a watch channel rather than a bare flag: `wait` checks the current
/// value under the channel lock before parking, so a finish that races with a
/// new waiter is never missed.
#[derive(Clone)]
pub struct RendezvousGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    name: String,
    finished: watch::Sender<bool>,
}

impl RendezvousGate {
    /// Creates an unfinished gate. The name only shows up in logs.
    pub fn new(name: impl Into<String>) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                name: name.into(),
                finished,
            }),
        }
    }

    /// Returns the gate's descriptive name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks the gate finished, releasing every current and future waiter.
    ///
    /// Safe to call any number of times, with or without waiters.
    pub fn finish(&self) {
        let changed = self.inner.finished.send_if_modified(|finished| {
            if *finished {
                false
            } else {
                *finished = true;
                true
            }
        });

        if changed {
            tracing::debug!(gate = %self.inner.name, "Gate finished");
        }
    }

    /// Checks whether the gate has been finished without waiting.
    pub fn is_finished(&self) -> bool {
        *self.inner.finished.borrow()
    }

    /// Waits until the gate is finished or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If the gate was not finished within `timeout`.
    ///   The error carries `label` so the failing wait can be identified.
    pub async fn wait(&self, timeout: Duration, label: &str) -> Result<()> {
        let mut receiver = self.inner.finished.subscribe();
        tracing::trace!(gate = %self.inner.name, "{label}");

        let outcome = tokio::time::timeout(timeout, receiver.wait_for(|finished| *finished))
            .await
            .map(|changed| changed.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            // The sender lives as long as `self`, so the channel cannot close under us.
            Ok(Err(_)) => Err(HarnessError::setup(format!(
                "gate '{}' closed while waiting",
                self.inner.name
            ))),
            Err(_) => {
                tracing::warn!(gate = %self.inner.name, ?timeout, "Gate wait timed out: {label}");
                Err(HarnessError::timeout(label, timeout))
            }
        }
    }
}

impl std::fmt::Debug for RendezvousGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousGate")
            .field("name", &self.inner.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
