//! Repeating tasks with explicit start and cancel.
//!
//! A [`ScheduledTask`] moves through
//! `Idle -> Armed -> (Firing -> Armed)* -> Cancelled`. Each tick runs the body
//! to completion in its own tokio task before the timer re-arms, so ticks of
//! one task never overlap and an error or panic in a body only ends that tick.
//! Timing uses the tokio clock, which tests can pause and advance.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::SessionError;

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Armed,
    Firing,
    Cancelled,
}

/// Point-in-time view of a task, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub cadence_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub runs: u64,
}

#[derive(Debug)]
struct TaskStatus {
    state: TaskState,
    last_run_at: Option<DateTime<Utc>>,
    runs: u64,
}

/// A body that fires on a fixed cadence until cancelled.
pub struct ScheduledTask {
    name: String,
    cadence: Duration,
    status: Arc<Mutex<TaskStatus>>,
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledTask {
    /// Creates an idle task. Nothing runs until [`ScheduledTask::start`].
    pub fn new(name: impl Into<String>, cadence: Duration) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            cadence,
            status: Arc::new(Mutex::new(TaskStatus {
                state: TaskState::Idle,
                last_run_at: None,
                runs: 0,
            })),
            cancel_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn state(&self) -> TaskState {
        lock(&self.status).state
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.status).last_run_at
    }

    /// Number of completed runs, including failed ones.
    pub fn runs(&self) -> u64 {
        lock(&self.status).runs
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let status = lock(&self.status);
        TaskSnapshot {
            name: self.name.clone(),
            state: status.state,
            cadence_secs: self.cadence.as_secs(),
            last_run_at: status.last_run_at,
            runs: status.runs,
        }
    }

    /// Arms the task. The first tick fires one cadence from now.
    ///
    /// Starting a task that is not idle, or whose cadence is zero, is a no-op;
    /// a cancelled task never resumes.
    pub fn start<F, Fut>(&self, body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        if !self.leave_idle(TaskState::Armed) {
            return;
        }
        self.spawn_loop(body);
    }

    /// Runs the body once right away, then arms the task.
    pub async fn start_after_initial_run<F, Fut>(&self, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        if !self.leave_idle(TaskState::Firing) {
            return;
        }

        info!("Running initial '{}' cycle", self.name);
        fire(&self.name, &self.status, body()).await;

        {
            let mut status = lock(&self.status);
            if status.state == TaskState::Cancelled {
                return;
            }
            status.state = TaskState::Armed;
        }
        self.spawn_loop(body);
    }

    /// Cancels the task. No tick starts after this returns; a body already
    /// running is allowed to finish.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
        let mut status = lock(&self.status);
        if status.state != TaskState::Cancelled {
            info!("Cancelling task '{}'", self.name);
            status.state = TaskState::Cancelled;
        }
    }

    /// Waits for the timer loop to exit after [`ScheduledTask::cancel`].
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Task '{}' loop ended abnormally: {}", self.name, e);
            }
        }
    }

    /// Moves an idle task with a usable cadence to `next`.
    fn leave_idle(&self, next: TaskState) -> bool {
        if self.cadence.is_zero() {
            error!("Task '{}' has a zero cadence and cannot be started", self.name);
            return false;
        }
        let mut status = lock(&self.status);
        if status.state != TaskState::Idle {
            warn!(
                "Task '{}' is {:?} and cannot be started",
                self.name, status.state
            );
            return false;
        }
        status.state = next;
        true
    }

    fn spawn_loop<F, Fut>(&self, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        let name = self.name.clone();
        let cadence = self.cadence;
        let status = Arc::clone(&self.status);
        let mut cancel_rx = self.cancel_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + cadence, cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Task '{}' armed with cadence {:?}", name, cadence);

            loop {
                if *cancel_rx.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }

                {
                    let mut guard = lock(&status);
                    if guard.state == TaskState::Cancelled {
                        break;
                    }
                    guard.state = TaskState::Firing;
                }

                fire(&name, &status, body()).await;

                let mut guard = lock(&status);
                if guard.state == TaskState::Cancelled {
                    break;
                }
                guard.state = TaskState::Armed;
            }

            debug!("Task '{}' loop stopped", name);
        });

        *self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_tx.send_replace(true);
    }
}

async fn fire<Fut>(name: &str, status: &Mutex<TaskStatus>, run: Fut)
where
    Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
{
    match tokio::spawn(run).await {
        Ok(Ok(())) => debug!("Task '{}' tick completed", name),
        Ok(Err(e)) => error!("Task '{}' tick failed ({}): {}", name, e.kind(), e),
        Err(e) => error!("Task '{}' tick aborted: {}", name, e),
    }

    let mut guard = lock(status);
    guard.last_run_at = Some(Utc::now());
    guard.runs += 1;
}

fn lock(status: &Mutex<TaskStatus>) -> std::sync::MutexGuard<'_, TaskStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
