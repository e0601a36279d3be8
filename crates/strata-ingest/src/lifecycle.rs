//! Service state machine on a watch channel.

use std::fmt;
use strata_common::{Error, Result};
use tokio::sync::watch;
use tracing::{error, info};

/// Lifecycle states of an ingestion service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ServiceState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Starting | Self::Terminated)
                | (Self::Starting, Self::Running | Self::Stopping | Self::Failed)
                | (Self::Running, Self::Stopping | Self::Failed)
                | (Self::Stopping, Self::Terminated | Self::Failed)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct Status {
    state: ServiceState,
    cause: Option<String>,
}

/// Guarded state machine shared by a service and its observers.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    tx: watch::Sender<Status>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(Status {
            state: ServiceState::New,
            cause: None,
        });
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.tx.borrow().state
    }

    /// Why the service failed, if it did.
    pub fn failure_cause(&self) -> Option<String> {
        self.tx.borrow().cause.clone()
    }

    /// Move to `next`, failing if the current state does not allow it.
    pub fn transition(&self, next: ServiceState) -> Result<()> {
        let mut from = None;
        self.tx.send_if_modified(|status| {
            if status.state.can_transition_to(next) {
                from = Some(status.state);
                status.state = next;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => {
                info!("{}: {} -> {}", self.name, from, next);
                Ok(())
            }
            None => Err(Error::IllegalState(format!(
                "{}: cannot move from {} to {}",
                self.name,
                self.state(),
                next
            ))),
        }
    }

    /// Mark the service failed. Returns false if it had already reached a
    /// terminal state.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        let failed = self.tx.send_if_modified(|status| {
            if status.state.can_transition_to(ServiceState::Failed) {
                status.state = ServiceState::Failed;
                status.cause = Some(cause.clone());
                true
            } else {
                false
            }
        });
        if failed {
            error!("{} failed: {}", self.name, cause);
        }
        failed
    }

    /// Wait until the service is running.
    ///
    /// Errors if it reaches a terminal state first.
    pub async fn await_running(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let status = rx
            .wait_for(|s| s.state == ServiceState::Running || s.state.is_terminal())
            .await
            .map_err(|_| Error::internal("lifecycle channel closed"))?
            .clone();
        match status.state {
            ServiceState::Running => Ok(()),
            state => Err(Error::IllegalState(format!(
                "{} is {}{}",
                self.name,
                state,
                status.cause.map(|c| format!(": {c}")).unwrap_or_default()
            ))),
        }
    }

    /// Wait for a terminal state and return it.
    pub async fn await_terminated(&self) -> ServiceState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => status.state,
            Err(_) => self.state(),
        }
    }
}
