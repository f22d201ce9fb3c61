//! Long-lived background tasks that drive pins on their own schedule.
//!
//! Every task is spawned with a stop signal and kept as an explicit
//! [`TaskHandle`]; stopping sends the signal and waits for the task to exit,
//! so nothing is left running behind the caller's back.

pub mod clock;
pub mod flash;

pub use clock::{ClockDriver, LocalTime, TimeSource};
pub use flash::FlashController;

use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn `task` on the runtime, handing it the receiving end of its stop
    /// signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        Self {
            name: name.into(),
            stop: Some(tx),
            join: tokio::spawn(task(rx)),
        }
    }

    /// Whether the task has already returned.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            // The task may already have exited on its own.
            let _ = tx.send(());
        }
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!("Task {} panicked: {}", self.name, e);
            }
        }
    }
}
