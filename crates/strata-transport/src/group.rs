use std::future::Future;

use strata_core::TransportError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs cooperating pipeline tasks under one cancellation scope.
///
/// The first task to fail cancels the scope so its siblings wind down, and
/// its error is the one returned by [`TaskGroup::wait`]. Tasks observing
/// cancellation return `Ok(())`, so a cancelled group finishes cleanly.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: JoinSet<(&'static str, Result<(), TransportError>)>,
}

impl TaskGroup {
    /// Creates a group whose scope is cancelled together with `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token shared by every task of this group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Waits for every task; returns the first failure, if any.
    pub async fn wait(mut self) -> Result<(), TransportError> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(err))) => (name, err),
                Err(join_err) => ("unknown", TransportError::TaskFailed(join_err.to_string())),
            };

            let (name, err) = failure;
            if first_error.is_none() {
                warn!(task = name, error = %err, "pipeline task failed, cancelling siblings");
                self.token.cancel();
                first_error = Some(err);
            } else {
                debug!(task = name, error = %err, "suppressing follow-up task failure");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
