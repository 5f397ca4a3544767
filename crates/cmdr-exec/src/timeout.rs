//! Timeout watcher racing a deadline against command completion

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::error::ExecError;
use crate::traits::{BackendKind, Terminate};

/// Background task that terminates the backend if the command outlives
/// its timeout
///
/// A zero timeout makes the watchdog inert. Exactly one outcome is produced
/// per watchdog.
pub(crate) struct Watchdog {
    done: oneshot::Sender<()>,
    outcome: oneshot::Receiver<Result<(), ExecError>>,
    settled: Option<Result<(), ExecError>>,
}

impl Watchdog {
    pub(crate) fn spawn(
        timeout: Duration,
        backend: BackendKind,
        terminator: Arc<dyn Terminate>,
    ) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        tokio::spawn(async move {
            let outcome = watch(timeout, backend, terminator, done_rx).await;
            let _ = outcome_tx.send(outcome);
        });

        Self {
            done: done_tx,
            outcome: outcome_rx,
            settled: None,
        }
    }

    /// Resolve with the timeout error once the deadline passed and the
    /// backend was terminated
    ///
    /// Stays pending forever if the watchdog settled without firing, so it
    /// can be raced against other work. Cancel safe.
    pub(crate) async fn expired(&mut self) -> ExecError {
        if self.settled.is_none() {
            let outcome = (&mut self.outcome).await.unwrap_or(Ok(()));
            self.settled = Some(outcome);
        }
        match &self.settled {
            Some(Err(err)) => err.clone(),
            _ => std::future::pending().await,
        }
    }

    /// Signal that the command finished and collect the outcome
    pub(crate) async fn finish(self) -> Result<(), ExecError> {
        let _ = self.done.send(());
        match self.settled {
            Some(outcome) => outcome,
            None => self.outcome.await.unwrap_or(Ok(())),
        }
    }
}

async fn watch(
    timeout: Duration,
    backend: BackendKind,
    terminator: Arc<dyn Terminate>,
    done: oneshot::Receiver<()>,
) -> Result<(), ExecError> {
    if timeout.is_zero() {
        return Ok(());
    }

    tokio::select! {
        () = sleep(timeout) => {
            error!(%backend, ?timeout, "command timed out, terminating");
            terminator.terminate().await;
            Err(ExecError::Timeout { backend, timeout })
        }
        // a dropped sender means the run was abandoned before completion
        _ = done => {
            debug!(%backend, "command finished before timeout");
            Ok(())
        }
    }
}
