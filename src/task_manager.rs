//! Manages the lifecycle of all spawned tasks in the application.
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A centralized manager for all spawned tasks.
///
/// This struct is responsible for:
/// - Spawning named tasks and keeping track of their `JoinHandle`s.
/// - Shutting down within a bounded grace period, aborting any task that
///   has not finished by then.
#[derive(Clone, Debug)]
pub struct TaskManager {
    handles: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskManager {
    /// Creates a new `TaskManager`.
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
            shutdown_rx,
        }
    }

    /// Spawns a new task and adds its handle to the manager.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task_name = %name, "Spawning task");
        let handle = tokio::spawn(future);
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, handle));
    }

    /// Returns a clone of the shutdown receiver.
    pub fn get_shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Number of tasks currently tracked.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits up to `grace` for all managed tasks to complete, then aborts
    /// whatever is still running.
    pub async fn shutdown(self, grace: Duration) {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect::<Vec<_>>();
        info!(
            "TaskManager shutting down. Waiting up to {:?} for {} tasks to complete...",
            grace,
            handles.len()
        );

        let (task_names, handles): (Vec<String>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        debug!(tasks = ?task_names, "Awaiting all tasks.");

        let results = match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(results) => results,
            Err(_) => {
                let stragglers: Vec<&str> = task_names
                    .iter()
                    .zip(&abort_handles)
                    .filter(|(_, handle)| !handle.is_finished())
                    .map(|(name, _)| name.as_str())
                    .collect();
                warn!(tasks = ?stragglers, "Grace period elapsed; aborting remaining tasks.");
                for handle in &abort_handles {
                    handle.abort();
                }
                return;
            }
        };

        let mut panics = Vec::new();
        for (task_name, result) in task_names.iter().zip(results) {
            match result {
                Ok(_) => {
                    debug!(task_name = %task_name, "Task shut down gracefully.");
                }
                Err(e) => {
                    error!(task_name = %task_name, "Task panicked during shutdown.");
                    panics.push((task_name, e));
                }
            }
        }

        if !panics.is_empty() {
            error!(
                "{} tasks panicked during shutdown: {:?}",
                panics.len(),
                panics
            );
        } else {
            info!("All tasks shut down gracefully.");
        }
    }
}
