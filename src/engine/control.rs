//! Cooperative termination and interruption
//!
//! Stopping is two-phase: first every task is asked to terminate and
//! checks the flag at its loop boundary; after a grace period the tasks are
//! interrupted, which wakes any pending [`Control::sleep`]. A store call in
//! flight is never cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// A sleep was cut short by [`Control::interrupt`]
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("interrupted")]
pub struct Interrupted;

/// Stop signals shared by a task and whoever stops it
#[derive(Debug)]
pub struct Control {
    terminate: AtomicBool,
    interrupt: watch::Sender<bool>,
}

impl Control {
    pub fn new() -> Self {
        Control {
            terminate: AtomicBool::new(false),
            interrupt: watch::Sender::new(false),
        }
    }

    /// Ask the task to finish at its next loop boundary
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Terminate and wake every pending sleep
    pub fn interrupt(&self) {
        self.request_terminate();
        self.interrupt.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Whether the task should leave its loop
    pub fn should_stop(&self) -> bool {
        self.is_terminated() || self.is_interrupted()
    }

    /// Resolves once [`Control::interrupt`] was called
    pub async fn interrupted(&self) {
        let mut interrupted = self.interrupt.subscribe();
        let _ = interrupted.wait_for(|set| *set).await;
    }

    /// Sleep unless interrupted
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let mut interrupted = self.interrupt.subscribe();
        if *interrupted.borrow_and_update() {
            return Err(Interrupted);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = interrupted.changed() => Err(Interrupted),
        }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_terminate_does_not_interrupt_sleep() {
        let control = Control::new();
        control.request_terminate();
        assert!(control.should_stop());
        assert_eq!(control.sleep(Duration::from_millis(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_interrupt_wakes_sleep() {
        let control = Arc::new(Control::new());
        let sleeper = control.clone();
        let start = Instant::now();
        let task = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.interrupt();

        assert_eq!(task.await.unwrap(), Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(control.is_terminated());
    }

    #[tokio::test]
    async fn test_sleep_after_interrupt_returns_immediately() {
        let control = Control::new();
        control.interrupt();
        assert_eq!(control.sleep(Duration::from_secs(30)).await, Err(Interrupted));
    }
}
