use chrono::{DateTime, Utc};
use fleet_core::{Entity, LogEntry, LogEvent, RunLifecycle, StatusSnapshot, TaskState};

use crate::config::MonitorConfig;
use crate::controller::{BatchController, StopTransition};
use crate::error::{MonitorError, MonitorResult};
use crate::ingest::RunLog;
use crate::reconcile::{apply_snapshot, ReconcileReport};
use crate::registry::{EntityRegistry, RegistryReload};
use crate::view::ViewModel;

/// Result of ingesting one pushed log event.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub entry: LogEntry,
    /// The event was a terminal sentinel and it ended the active run.
    pub finished_run: bool,
}

/// Everything the monitor mutates. All transitions are synchronous; the
/// runtime serializes calls onto one task.
#[derive(Debug)]
pub struct MonitorState {
    registry: EntityRegistry,
    log: RunLog,
    controller: BatchController,
    awaiting_start_ack: Option<u64>,
    /// A sentinel arrived before the engine acknowledged the current start.
    finish_pending: bool,
    view_log_tail: usize,
}

impl MonitorState {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            registry: EntityRegistry::new(),
            log: RunLog::with_capacity(config.log_capacity),
            controller: BatchController::new(),
            awaiting_start_ack: None,
            finish_pending: false,
            view_log_tail: config.view_log_tail,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn lifecycle(&self) -> RunLifecycle {
        self.controller.lifecycle()
    }

    pub fn epoch(&self) -> u64 {
        self.controller.epoch()
    }

    pub fn awaiting_start_ack(&self) -> Option<u64> {
        self.awaiting_start_ack
    }

    pub fn load_entities(&mut self, entities: Vec<Entity>) -> MonitorResult<RegistryReload> {
        if !self.lifecycle().is_idle() {
            return Err(MonitorError::AlreadyRunning);
        }
        Ok(self.registry.replace(entities))
    }

    /// Idle -> Running: bumps the epoch, resets every entity to pending and
    /// clears the log.
    pub fn begin_run(&mut self) -> MonitorResult<u64> {
        let epoch = self.controller.begin_run(self.registry.len())?;
        self.registry.reset_all(&TaskState::pending());
        self.log.clear();
        self.awaiting_start_ack = Some(epoch);
        self.finish_pending = false;
        Ok(epoch)
    }

    /// Clears the start gate. Returns true when a sentinel seen before the
    /// acknowledgement ended the run here.
    pub fn acknowledge_start(&mut self, epoch: u64) -> bool {
        if self.awaiting_start_ack != Some(epoch) {
            return false;
        }
        self.awaiting_start_ack = None;
        std::mem::take(&mut self.finish_pending) && self.controller.finish()
    }

    /// Returns to Idle after the engine refused to start. Entities stay
    /// pending with the failure as their message.
    pub fn rollback_start(&mut self, epoch: u64, reason: &str) -> bool {
        if self.awaiting_start_ack == Some(epoch) {
            self.awaiting_start_ack = None;
            self.finish_pending = false;
        }
        if !self.controller.rollback(epoch) {
            return false;
        }
        let message = format!("start failed: {reason}");
        for state in self.registry.states_mut() {
            state.message = message.clone();
        }
        true
    }

    /// Appends to the log. A terminal sentinel ends the active run. Before
    /// the engine has acknowledged the current start the sentinel is held
    /// and applied by `acknowledge_start`.
    pub fn ingest(&mut self, event: LogEvent, received_at: DateTime<Utc>) -> Ingested {
        let sentinel = event.is_terminal_sentinel();
        let entry = self.log.append(event, received_at).clone();
        let finished_run = if !sentinel || self.lifecycle().is_idle() {
            false
        } else if self.awaiting_start_ack.is_some() {
            self.finish_pending = true;
            false
        } else {
            self.controller.finish()
        };
        Ingested {
            entry,
            finished_run,
        }
    }

    /// Applies a poll tagged with `epoch`. Returns `None` when the poll
    /// belongs to an earlier run.
    pub fn apply_poll(&mut self, epoch: u64, snapshot: &StatusSnapshot) -> Option<ReconcileReport> {
        if !self.controller.is_current(epoch) {
            return None;
        }
        Some(apply_snapshot(&mut self.registry, snapshot))
    }

    pub fn begin_stop(&mut self) -> StopTransition {
        self.controller.begin_stop()
    }

    pub fn force_idle(&mut self) -> bool {
        self.awaiting_start_ack = None;
        self.finish_pending = false;
        self.controller.finish()
    }

    pub fn view(&self) -> ViewModel {
        ViewModel::project(&self.controller, &self.registry, &self.log, self.view_log_tail)
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{RemoteResult, Severity, TaskStatus};

    use super::*;

    fn loaded(ids: &[&str]) -> MonitorState {
        let mut state = MonitorState::new(&MonitorConfig::default());
        state
            .load_entities(ids.iter().map(|id| Entity::new(*id, *id)).collect())
            .expect("load");
        state
    }

    #[test]
    fn start_resets_every_entity_and_the_log() {
        let mut state = loaded(&["0xA", "0xB"]);
        state.ingest(LogEvent::new("SYSTEM", "boot", Severity::Info), Utc::now());
        let epoch = state.begin_run().expect("start");
        assert_eq!(epoch, 1);
        assert!(state.log().is_empty());
        assert!(state
            .registry()
            .iter()
            .all(|(_, s)| s.status == TaskStatus::Pending && s.message == "pending"));
    }

    #[test]
    fn stale_poll_is_dropped() {
        let mut state = loaded(&["0xA"]);
        let first = state.begin_run().expect("start");
        state.acknowledge_start(first);
        state.force_idle();
        let second = state.begin_run().expect("restart");
        assert_ne!(first, second);

        let snapshot = StatusSnapshot::empty()
            .with_result("0xA", RemoteResult::succeeded("old run", Some("tok".into())));
        assert_eq!(state.apply_poll(first, &snapshot), None);
        assert_eq!(state.registry().state("0xA"), Some(&TaskState::pending()));

        let report = state.apply_poll(second, &snapshot).expect("current epoch");
        assert_eq!(report.changed, 1);
    }

    #[test]
    fn sentinel_after_start_ack_ends_run() {
        let mut state = loaded(&["0xA"]);
        let epoch = state.begin_run().expect("start");
        assert!(!state.acknowledge_start(epoch));
        let done = state.ingest(
            LogEvent::new("SYSTEM", "All tasks completed", Severity::Success),
            Utc::now(),
        );
        assert!(done.finished_run);
        assert_eq!(state.lifecycle(), RunLifecycle::Idle);
    }

    #[test]
    fn sentinel_before_start_ack_ends_run_on_ack() {
        let mut state = loaded(&["0xA"]);
        let epoch = state.begin_run().expect("start");
        let early = state.ingest(
            LogEvent::new("SYSTEM", "All tasks completed", Severity::Success),
            Utc::now(),
        );
        assert!(!early.finished_run);
        assert_eq!(state.lifecycle(), RunLifecycle::Running);

        assert!(state.acknowledge_start(epoch));
        assert_eq!(state.lifecycle(), RunLifecycle::Idle);
        assert!(!state.acknowledge_start(epoch));
        assert_eq!(state.log().len(), 1);
    }

    #[test]
    fn held_sentinel_is_dropped_by_rollback() {
        let mut state = loaded(&["0xA"]);
        let first = state.begin_run().expect("start");
        state.ingest(
            LogEvent::new("SYSTEM", "Tasks stopped by user", Severity::Info),
            Utc::now(),
        );
        assert!(state.rollback_start(first, "engine offline"));

        let second = state.begin_run().expect("restart");
        assert!(!state.acknowledge_start(second));
        assert_eq!(state.lifecycle(), RunLifecycle::Running);
    }

    #[test]
    fn sentinel_while_idle_is_only_logged() {
        let mut state = loaded(&["0xA"]);
        let ingested = state.ingest(
            LogEvent::new("SYSTEM", "All tasks completed", Severity::Success),
            Utc::now(),
        );
        assert!(!ingested.finished_run);
        assert_eq!(state.log().len(), 1);
    }

    #[test]
    fn rollback_keeps_entities_pending_with_reason() {
        let mut state = loaded(&["0xA", "0xB"]);
        let epoch = state.begin_run().expect("start");
        assert!(state.rollback_start(epoch, "engine offline"));
        assert_eq!(state.lifecycle(), RunLifecycle::Idle);
        assert_eq!(state.epoch(), 1);
        assert!(state.registry().iter().all(|(_, s)| {
            s.status == TaskStatus::Pending && s.message == "start failed: engine offline"
        }));
        assert_eq!(state.begin_run(), Ok(2));
    }

    #[test]
    fn load_rejected_while_running() {
        let mut state = loaded(&["0xA"]);
        state.begin_run().expect("start");
        assert_eq!(
            state.load_entities(vec![Entity::new("0xB", "b")]),
            Err(MonitorError::AlreadyRunning)
        );
        assert!(state.registry().contains("0xA"));
    }

    #[test]
    fn detail_present_only_on_success() {
        let mut state = loaded(&["0xA", "0xB", "0xC"]);
        let epoch = state.begin_run().expect("start");
        let snapshot = StatusSnapshot::empty()
            .with_result("0xA", RemoteResult::succeeded("ok", Some("tok".into())))
            .with_result("0xB", RemoteResult::failed("nope"))
            .with_result("0xC", RemoteResult::running("Running..."));
        state.apply_poll(epoch, &snapshot);
        for row in state.view().rows {
            assert_eq!(row.detail.is_some(), row.status == TaskStatus::Success);
        }
    }
}
