//! Detached side effects with bounded concurrency.
//!
//! Work that must not hold up a request (publishing a share event) runs here.
//! Every task gets a permit, its own deadline, and reports failures on a
//! channel instead of vanishing.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// A background task that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: &'static str,
    /// What the task was working on, e.g. a transfer id.
    pub subject: String,
    pub error: String,
}

#[derive(Clone)]
pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    timeout: Duration,
    tracker: TaskTracker,
    failures: mpsc::UnboundedSender<TaskFailure>,
}

impl BackgroundTasks {
    pub fn new(
        concurrency: usize,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let tasks = Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            timeout,
            tracker: TaskTracker::new(),
            failures,
        };
        (tasks, rx)
    }

    pub fn spawn<F, E>(&self, task: &'static str, subject: String, work: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let permits = self.permits.clone();
        let timeout = self.timeout;
        let failures = self.failures.clone();

        self.tracker.spawn(async move {
            let error = match permits.acquire_owned().await {
                Err(_) => Some("task runner closed".to_string()),
                Ok(_permit) => match tokio::time::timeout(timeout, work).await {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(_) => Some(format!("timed out after {:?}", timeout)),
                },
            };

            match error {
                None => debug!(task, subject = %subject, "background task finished"),
                Some(error) => {
                    warn!(task, subject = %subject, error = %error, "background task failed");
                    let _ = failures.send(TaskFailure {
                        task,
                        subject,
                        error,
                    });
                }
            }
        });
    }

    /// Wait until every task spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
