//! In-process sweep triggers.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use crate::error::Result;
use crate::traits::SweepTrigger;

/// Wakes an in-process sweep worker through a shared `Notify`.
///
/// Multiple schedules before the worker wakes collapse into one sweep.
#[derive(Debug, Clone, Default)]
pub struct NotifyTrigger {
    notify: Arc<Notify>,
}

impl NotifyTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trigger that wakes whoever waits on `notify`.
    pub fn from_notify(notify: Arc<Notify>) -> Self {
        Self { notify }
    }

    /// Handle for the waiting side.
    pub fn notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl SweepTrigger for NotifyTrigger {
    fn schedule(&self) -> Result<()> {
        trace!(subsystem = "outbox", component = "trigger", "Delivery sweep scheduled");
        self.notify.notify_one();
        Ok(())
    }
}

/// Trigger that schedules nothing. For callers relying only on the periodic sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrigger;

impl SweepTrigger for NoopTrigger {
    fn schedule(&self) -> Result<()> {
        Ok(())
    }
}
