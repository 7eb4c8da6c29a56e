use fleet_core::{LogEntry, RunLifecycle, TaskState, TaskStatus};
use serde::Serialize;

use crate::controller::BatchController;
use crate::ingest::RunLog;
use crate::registry::EntityRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub processed: usize,
}

impl Counters {
    pub fn tally<'a>(states: impl IntoIterator<Item = &'a TaskState>) -> Self {
        let mut counters = Counters::default();
        for state in states {
            counters.total += 1;
            match state.status {
                TaskStatus::Pending => counters.pending += 1,
                TaskStatus::Running => counters.running += 1,
                TaskStatus::Success => counters.succeeded += 1,
                TaskStatus::Failed => counters.failed += 1,
            }
        }
        counters.processed = counters.total - counters.pending;
        counters
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityRow {
    pub id: String,
    pub display_name: String,
    pub status: TaskStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Read-only projection handed to renderers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewModel {
    pub lifecycle: RunLifecycle,
    pub epoch: u64,
    pub rows: Vec<EntityRow>,
    pub counters: Counters,
    pub log_tail: Vec<LogEntry>,
    pub log_len: usize,
    pub log_evicted: u64,
}

impl ViewModel {
    pub fn project(
        controller: &BatchController,
        registry: &EntityRegistry,
        log: &RunLog,
        log_tail: usize,
    ) -> Self {
        let rows = registry
            .iter()
            .map(|(entity, state)| EntityRow {
                id: entity.id.clone(),
                display_name: entity.display_name.clone(),
                status: state.status,
                message: state.message.clone(),
                detail: state.detail.clone(),
            })
            .collect();
        Self {
            lifecycle: controller.lifecycle(),
            epoch: controller.epoch(),
            rows,
            counters: Counters::tally(registry.iter().map(|(_, state)| state)),
            log_tail: log.tail(log_tail),
            log_len: log.len(),
            log_evicted: log.evicted(),
        }
    }

    pub fn row(&self, id: &str) -> Option<&EntityRow> {
        self.rows.iter().find(|row| row.id == id)
    }

    pub fn is_idle(&self) -> bool {
        self.lifecycle.is_idle()
    }
}
