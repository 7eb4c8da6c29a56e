use fleet_core::{RemoteResult, StatusSnapshot, TaskState, TaskStatus};

use crate::registry::EntityRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Changed,
    Unchanged,
    /// A not-finished result arrived for an entity already in a terminal
    /// state.
    IgnoredRegression,
}

/// Folds one remote result into the local state.
///
/// Applying the same result twice leaves the state as after the first
/// application. `detail` is only kept when the result is a finished success.
pub fn merge_result(state: &mut TaskState, result: &RemoteResult) -> MergeOutcome {
    let next = if !result.finished {
        if state.status.is_terminal() {
            return MergeOutcome::IgnoredRegression;
        }
        TaskState {
            status: TaskStatus::Running,
            message: result.message.clone(),
            detail: None,
        }
    } else if result.success {
        TaskState {
            status: TaskStatus::Success,
            message: result.message.clone(),
            detail: result.detail.clone(),
        }
    } else {
        TaskState {
            status: TaskStatus::Failed,
            message: result.message.clone(),
            detail: None,
        }
    };

    if *state == next {
        MergeOutcome::Unchanged
    } else {
        *state = next;
        MergeOutcome::Changed
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub changed: usize,
    pub unchanged: usize,
    pub regressions: usize,
    /// Results for ids the registry does not know.
    pub unknown: usize,
    /// Registered entities the snapshot said nothing about.
    pub missing: usize,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        self.changed > 0
    }
}

/// Applies a whole snapshot. Entities absent from the snapshot keep their
/// state.
pub fn apply_snapshot(registry: &mut EntityRegistry, snapshot: &StatusSnapshot) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for (id, result) in &snapshot.results {
        let Some(state) = registry.state_mut(id) else {
            report.unknown += 1;
            continue;
        };
        match merge_result(state, result) {
            MergeOutcome::Changed => report.changed += 1,
            MergeOutcome::Unchanged => report.unchanged += 1,
            MergeOutcome::IgnoredRegression => report.regressions += 1,
        }
    }
    report.missing = registry
        .entities()
        .iter()
        .filter(|entity| !snapshot.results.contains_key(&entity.id))
        .count();
    report
}
