//! Bounded pool of controller sessions.
//!
//! The pool never hands one session to two callers. A [`SessionGuard`] owns
//! its session and a semaphore permit; both are given back when the guard is
//! released or dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{ControllerEndpoint, RemoteCommand, RemoteSession, SessionFactory};
use crate::error::{OrchestratorError, Result};

#[derive(Clone)]
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    endpoint: ControllerEndpoint,
    semaphore: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl SessionPool {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        endpoint: ControllerEndpoint,
        max_sessions: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            endpoint,
            semaphore: Arc::new(Semaphore::new(max_sessions.max(1))),
            connect_timeout,
        }
    }

    pub fn endpoint(&self) -> &ControllerEndpoint {
        &self.endpoint
    }

    pub fn available_sessions(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot and returns a connected session.
    pub async fn acquire(&self) -> Result<SessionGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::Connection("session pool is closed".to_string()))?;

        let mut session = self.factory.open(&self.endpoint);
        match tokio::time::timeout(self.connect_timeout, session.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.close().await;
                return Err(e);
            }
            Err(_) => {
                session.close().await;
                return Err(OrchestratorError::Connection(format!(
                    "timed out after {}s connecting to {}",
                    self.connect_timeout.as_secs(),
                    self.endpoint
                )));
            }
        }

        debug!(endpoint = %self.endpoint, available = self.semaphore.available_permits(), "Session acquired.");
        Ok(SessionGuard {
            session: Some(session),
            permit: Some(permit),
        })
    }
}

/// Exclusive use of one connected session.
pub struct SessionGuard {
    session: Option<Box<dyn RemoteSession>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    /// Runs `command`, failing with `Timeout` once `timeout` elapses.
    ///
    /// `operation` names the work in the timeout error.
    pub async fn run(
        &mut self,
        command: &RemoteCommand,
        timeout: Duration,
        operation: &str,
    ) -> Result<String> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| OrchestratorError::Connection("session already released".to_string()))?;
        match tokio::time::timeout(timeout, session.execute(command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(command = %command, seconds = timeout.as_secs(), "Remote command timed out.");
                Err(OrchestratorError::Timeout {
                    operation: operation.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Closes the session and frees its pool slot.
    pub async fn release(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.permit.take();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        // The permit moves into the task so the slot stays taken until the
        // session is really closed.
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.close().await;
                    drop(permit);
                });
            }
            Err(_) => warn!("Session guard dropped outside a runtime; session not closed."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::mock::SimulatedController;
    use crate::controller::ControllerCommand;

    fn pool(controller: &SimulatedController, max_sessions: usize) -> SessionPool {
        SessionPool::new(
            Arc::new(controller.clone()),
            SimulatedController::endpoint(),
            max_sessions,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_release_returns_slot_and_closes() {
        let controller = SimulatedController::new();
        let pool = pool(&controller, 2);

        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.available_sessions(), 1);
        guard.release().await;
        assert_eq!(pool.available_sessions(), 2);
        assert_eq!(controller.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_still_closes() {
        let controller = SimulatedController::new();
        let pool = pool(&controller, 1);

        {
            let mut guard = pool.acquire().await.unwrap();
            guard
                .run(&ControllerCommand::list_instances(), Duration::from_secs(1), "listing")
                .await
                .unwrap();
        }
        // The close runs on a spawned task; acquiring again waits for it.
        let guard = pool.acquire().await.unwrap();
        guard.release().await;
        assert_eq!(controller.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let controller = SimulatedController::new();
        controller.fail_connect(true);
        let pool = pool(&controller, 1);

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Connection(_)));
        assert_eq!(pool.available_sessions(), 1);
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let controller = SimulatedController::new();
        controller.set_latency(Duration::from_millis(200));
        let pool = pool(&controller, 1);

        let mut guard = pool.acquire().await.unwrap();
        let err = guard
            .run(&ControllerCommand::list_instances(), Duration::from_millis(20), "listing instances")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { ref operation, .. } if operation == "listing instances"));
        guard.release().await;
    }
}
