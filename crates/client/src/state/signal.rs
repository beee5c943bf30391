//! One-shot completion signal for request/response milestones
//!
//! Callers block on protocol milestones (failover log fetched, stream
//! stopped) through these signals instead of a condition variable keyed
//! on a state byte. Each wait has an explicit timeout and a distinct
//! cancelled outcome for client disconnect.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum SignalState {
    Idle,
    Pending,
    Done,
    Failed(String),
    Cancelled,
}

/// Reusable completion slot for one operation kind
#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<SignalState>,
    operation: &'static str,
}

impl Signal {
    pub fn new(operation: &'static str) -> Self {
        let (tx, _) = watch::channel(SignalState::Idle);
        Self { tx, operation }
    }

    /// Arm the signal for a fresh request
    pub fn begin(&self) {
        self.tx.send_replace(SignalState::Pending);
    }

    /// Resolve successfully, waking all waiters
    pub fn complete(&self) {
        self.tx.send_replace(SignalState::Done);
    }

    /// Resolve with a failure, waking all waiters
    pub fn fail(&self, reason: impl Into<String>) {
        self.tx.send_replace(SignalState::Failed(reason.into()));
    }

    /// Cancel because the client is disconnecting
    pub fn cancel(&self) {
        self.tx.send_replace(SignalState::Cancelled);
    }

    /// Return to idle after a cancellation, e.g. on reconnect
    pub fn reset(&self) {
        self.tx.send_replace(SignalState::Idle);
    }

    /// Wait until the armed request resolves
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let resolved = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| {
                matches!(
                    state,
                    SignalState::Done | SignalState::Failed(_) | SignalState::Cancelled
                )
            }),
        )
        .await;
        match resolved {
            Err(_) => Err(ClientError::Timeout {
                operation: self.operation,
                elapsed: timeout,
            }),
            Ok(Err(_closed)) => Err(ClientError::Disconnected {
                operation: self.operation,
            }),
            Ok(Ok(state)) => match &*state {
                SignalState::Done => Ok(()),
                SignalState::Failed(reason) => Err(ClientError::RequestFailed(reason.clone())),
                SignalState::Cancelled => Err(ClientError::Disconnected {
                    operation: self.operation,
                }),
                _ => unreachable!("wait_for only resolves terminal states"),
            },
        }
    }
}
