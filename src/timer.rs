//! Cancellable deferred timers.
//!
//! A timer is a tokio task that sleeps and then posts one message into the event
//! loop channel. The owner keeps the [`TimerHandle`] and compares ids when the
//! message arrives: a message whose id no longer matches the held handle was
//! already queued when the timer was cancelled, and must be ignored.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Post `message` to `tx` after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<M>(id: u64, delay: Duration, tx: UnboundedSender<M>, message: M) -> Self
    where
        M: Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(message).is_err() {
                log::debug!("Timer {} fired after event loop shut down", id);
            }
        });
        Self { id, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Hands out timer ids, one sequence per owner
#[derive(Debug, Default)]
pub struct TimerIds {
    next: u64,
}

impl TimerIds {
    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// True when `fired` belongs to the timer still held in `slot`; clears the slot if so.
pub fn take_if_current(slot: &mut Option<TimerHandle>, fired: u64) -> bool {
    match slot {
        Some(handle) if handle.id() == fired => {
            *slot = None;
            true
        }
        _ => false,
    }
}
