use fleet_core::RunLifecycle;

use crate::error::{MonitorError, MonitorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTransition {
    AlreadyIdle,
    /// Running -> Stopping; the caller should ask the engine to stop.
    Requested,
    AlreadyStopping,
}

/// Lifecycle and run epoch. The epoch increments on every accepted start and
/// never decreases.
#[derive(Debug, Default, Clone)]
pub struct BatchController {
    lifecycle: RunLifecycle,
    epoch: u64,
}

impl BatchController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(&self) -> RunLifecycle {
        self.lifecycle
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    pub fn begin_run(&mut self, entity_count: usize) -> MonitorResult<u64> {
        if !self.lifecycle.is_idle() {
            return Err(MonitorError::AlreadyRunning);
        }
        if entity_count == 0 {
            return Err(MonitorError::NoEntities);
        }
        self.epoch += 1;
        self.lifecycle = RunLifecycle::Running;
        Ok(self.epoch)
    }

    /// Undoes a start whose remote request failed. The epoch is not reused.
    pub fn rollback(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || self.lifecycle.is_idle() {
            return false;
        }
        self.lifecycle = RunLifecycle::Idle;
        true
    }

    pub fn begin_stop(&mut self) -> StopTransition {
        match self.lifecycle {
            RunLifecycle::Idle => StopTransition::AlreadyIdle,
            RunLifecycle::Stopping => StopTransition::AlreadyStopping,
            RunLifecycle::Running => {
                self.lifecycle = RunLifecycle::Stopping;
                StopTransition::Requested
            }
        }
    }

    /// Returns true if the lifecycle actually changed.
    pub fn finish(&mut self) -> bool {
        if self.lifecycle.is_idle() {
            return false;
        }
        self.lifecycle = RunLifecycle::Idle;
        true
    }
}
