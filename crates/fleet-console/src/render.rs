use std::collections::HashMap;

use chrono::Local;
use fleet_core::{Entity, LogEntry, RemoteResult, RunLifecycle, Severity, StatusSnapshot, TaskStatus};
use fleet_monitor::{Counters, ViewModel};

const ID_HEAD: usize = 6;
const ID_TAIL: usize = 4;

/// `0x1234...abcd` for long ids, unchanged otherwise.
pub fn short_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= ID_HEAD + ID_TAIL + 3 {
        return id.to_string();
    }
    let head: String = chars[..ID_HEAD].iter().collect();
    let tail: String = chars[chars.len() - ID_TAIL..].iter().collect();
    format!("{head}...{tail}")
}

fn severity_tag(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "INFO",
        Severity::Success => " OK ",
        Severity::Error => "FAIL",
    }
}

pub fn format_log_line(entry: &LogEntry) -> String {
    let at = entry.received_at.with_timezone(&Local).format("%H:%M:%S");
    format!(
        "{at} [{}] {}: {}",
        severity_tag(entry.severity),
        short_id(&entry.entity_id),
        entry.message
    )
}

/// Severities to print while following a run; empty means all.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    severities: Vec<Severity>,
}

impl LogFilter {
    pub fn new(severities: Vec<Severity>) -> Self {
        Self { severities }
    }

    pub fn allows(&self, entry: &LogEntry) -> bool {
        self.severities.is_empty() || self.severities.contains(&entry.severity)
    }
}

pub fn format_counters(counters: &Counters) -> String {
    format!(
        "processed {}/{} | running {} | success {} | failed {} | pending {}",
        counters.processed,
        counters.total,
        counters.running,
        counters.succeeded,
        counters.failed,
        counters.pending
    )
}

/// Turns successive view models into printable change lines.
#[derive(Debug, Default)]
pub struct ViewDiff {
    lifecycle: Option<RunLifecycle>,
    rows: HashMap<String, (TaskStatus, String)>,
}

impl ViewDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&mut self, view: &ViewModel) -> Vec<String> {
        let mut lines = Vec::new();
        if self.lifecycle != Some(view.lifecycle) {
            lines.push(format!("== run {} is {} ==", view.epoch, view.lifecycle));
            self.lifecycle = Some(view.lifecycle);
        }
        for row in &view.rows {
            let current = (row.status, row.message.clone());
            if self.rows.get(&row.id) == Some(&current) {
                continue;
            }
            let mut line = format!(
                "{:<14} {:<8} {}",
                short_id(&row.id),
                row.status.as_str(),
                row.message
            );
            if row.detail.is_some() {
                line.push_str(" (detail received)");
            }
            lines.push(line);
            self.rows.insert(row.id.clone(), current);
        }
        if !lines.is_empty() {
            lines.push(format_counters(&view.counters));
        }
        lines
    }
}

pub fn format_summary(view: &ViewModel) -> String {
    let mut out = format!("run {} finished: {}", view.epoch, format_counters(&view.counters));
    if view.log_evicted > 0 {
        out.push_str(&format!(" ({} oldest log lines evicted)", view.log_evicted));
    }
    out
}

pub fn format_accounts(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return "no wallets registered".to_string();
    }
    let mut out = format!("{:<44} NAME\n", "ADDRESS");
    for entity in entities {
        out.push_str(&format!("{:<44} {}\n", entity.id, entity.display_name));
    }
    out.push_str(&format!("{} wallets", entities.len()));
    out
}

fn remote_status(result: &RemoteResult) -> TaskStatus {
    match (result.finished, result.success) {
        (false, _) => TaskStatus::Running,
        (true, true) => TaskStatus::Success,
        (true, false) => TaskStatus::Failed,
    }
}

/// One line per account in the snapshot, in registry order first and then
/// any ids the registry does not know. `only` keeps rows in that state.
pub fn format_status_table(
    snapshot: &StatusSnapshot,
    entities: &[Entity],
    only: Option<TaskStatus>,
) -> String {
    let mut out = format!(
        "engine {}\n",
        if snapshot.is_running { "running" } else { "idle" }
    );
    if snapshot.results.is_empty() {
        out.push_str("no results reported");
        return out;
    }

    let mut ids: Vec<&str> = entities
        .iter()
        .map(|entity| entity.id.as_str())
        .filter(|id| snapshot.results.contains_key(*id))
        .collect();
    let mut extra: Vec<&str> = snapshot
        .results
        .keys()
        .map(String::as_str)
        .filter(|id| !entities.iter().any(|entity| entity.id == *id))
        .collect();
    extra.sort_unstable();
    ids.extend(extra);

    let names: HashMap<&str, &str> = entities
        .iter()
        .map(|entity| (entity.id.as_str(), entity.display_name.as_str()))
        .collect();
    for id in ids {
        let Some(result) = snapshot.results.get(id) else {
            continue;
        };
        let state = remote_status(result);
        if only.is_some_and(|wanted| wanted != state) {
            continue;
        }
        out.push_str(&format!(
            "{:<14} {:<16} {:<8} {}\n",
            short_id(id),
            names.get(id).copied().unwrap_or("-"),
            state.as_str(),
            result.message
        ));
    }
    out.truncate(out.trim_end().len());
    out
}
