//! Concurrent probes for racing client operations against gate releases.
//!
//! A probe runs one client-visible operation on its own task and hands the
//! result back through a oneshot channel. The test checks, without blocking,
//! that the probe is still pending, releases whatever holds it up, then waits
//! for the result with a bound.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::error::{HarnessError, Result};

/// A client operation running concurrently with the test.
///
/// Dropping the probe aborts its task, so an early test failure does not leave
/// the operation parked on the system under test.
pub struct Probe<T> {
    label: String,
    receiver: oneshot::Receiver<T>,
    completed: Option<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> Probe<T> {
    /// Spawns `operation` on the current runtime.
    pub fn spawn<F>(label: impl Into<String>, operation: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let label = label.into();
        let (sender, receiver) = oneshot::channel();
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            let result = operation.await;
            if sender.send(result).is_err() {
                tracing::debug!(probe = %task_label, "Probe result dropped by test");
            }
        });

        tracing::debug!(probe = %label, "Probe started");
        Self {
            label,
            receiver,
            completed: None,
            handle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Checks that the operation has not completed yet, without waiting.
    ///
    /// A result found here is kept and handed out by [`Probe::await_within`].
    ///
    /// # Errors
    ///
    /// - `HarnessError::ProbeCompleted` - If the operation already produced a result
    /// - `HarnessError::ProbeAborted` - If the operation's task ended without a result
    pub fn assert_pending(&mut self) -> Result<()> {
        if self.completed.is_some() {
            return Err(HarnessError::ProbeCompleted {
                label: self.label.clone(),
            });
        }
        match self.receiver.try_recv() {
            Err(TryRecvError::Empty) => Ok(()),
            Ok(result) => {
                self.completed = Some(result);
                Err(HarnessError::ProbeCompleted {
                    label: self.label.clone(),
                })
            }
            Err(TryRecvError::Closed) => Err(HarnessError::ProbeAborted {
                label: self.label.clone(),
            }),
        }
    }

    /// Waits up to `timeout` for the operation's result.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Timeout` - If the operation did not finish in time
    /// - `HarnessError::ProbeAborted` - If the operation's task panicked or was aborted
    pub async fn await_within(&mut self, timeout: Duration) -> Result<T> {
        if let Some(result) = self.completed.take() {
            return Ok(result);
        }
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => {
                tracing::debug!(probe = %self.label, "Probe completed");
                Ok(result)
            }
            Ok(Err(_)) => Err(HarnessError::ProbeAborted {
                label: self.label.clone(),
            }),
            Err(_) => Err(HarnessError::timeout(
                format!("{} did not complete", self.label),
                timeout,
            )),
        }
    }
}

impl<T> Drop for Probe<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::RendezvousGate;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_blocked_on_gate_until_release() {
        let gate = RendezvousGate::new("blocker");
        let blocker = gate.clone();
        let mut probe = Probe::spawn("gated operation", async move {
            blocker.wait(Duration::from_secs(5), "probe blocker").await?;
            Ok::<_, HarnessError>(7)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        probe.assert_pending().unwrap();

        gate.finish();
        let value = probe.await_within(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_assert_pending_fails_once_completed() {
        let mut probe = Probe::spawn("instant", async { 1 });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let error = probe.assert_pending().unwrap_err();
        assert!(matches!(error, HarnessError::ProbeCompleted { .. }));
    }

    #[tokio::test]
    async fn test_result_survives_failed_pending_check() {
        let mut probe = Probe::spawn("early", async { "members" });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(probe.assert_pending().is_err());
        assert!(matches!(
            probe.assert_pending(),
            Err(HarnessError::ProbeCompleted { .. })
        ));

        let value = probe.await_within(Duration::from_millis(50)).await.unwrap();
        assert_eq!(value, "members");
    }

    #[tokio::test]
    async fn test_await_within_times_out() {
        let gate = RendezvousGate::new("never");
        let mut probe = Probe::spawn("stuck", async move {
            gate.wait(Duration::from_secs(30), "stuck").await
        });

        let error = probe
            .await_within(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
        assert!(error.to_string().contains("stuck did not complete"));
    }

    #[tokio::test]
    async fn test_panicking_operation_reports_abort() {
        let mut probe = Probe::spawn("panics", async {
            let members: Vec<u32> = Vec::new();
            members[0]
        });

        let error = probe
            .await_within(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(error, HarnessError::ProbeAborted { .. }));
    }
}
