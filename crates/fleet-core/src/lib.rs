use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod engine_ipc;

/// Entity id the engine uses for batch-level log lines.
pub const SYSTEM_ENTITY_ID: &str = "SYSTEM";

/// Log messages the engine emits when a batch ends.
pub const TERMINAL_SENTINELS: &[&str] = &[
    "All tasks completed",
    "Tasks stopped by user",
    "Run stopped by operator",
];

pub fn is_terminal_sentinel(message: &str) -> bool {
    let trimmed = message.trim();
    TERMINAL_SENTINELS
        .iter()
        .any(|sentinel| sentinel.eq_ignore_ascii_case(trimmed))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Entity {
    #[serde(alias = "address", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, alias = "name")]
    pub display_name: String,
}

impl Entity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" | "in-progress" | "in_progress" => Ok(TaskStatus::Running),
            "success" | "succeeded" | "ok" => Ok(TaskStatus::Success),
            "failed" | "failure" | "error" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Per-entity record owned by the monitor.
///
/// `detail` is only ever populated together with `TaskStatus::Success`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskState {
    pub status: TaskStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskState {
    pub fn ready() -> Self {
        Self {
            status: TaskStatus::Pending,
            message: "Ready to start".to_string(),
            detail: None,
        }
    }

    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            message: "pending".to_string(),
            detail: None,
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::ready()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "success" => Ok(Severity::Success),
            "error" => Ok(Severity::Error),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

/// A log line as pushed by the engine, before ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    #[serde(alias = "address")]
    pub entity_id: String,
    pub message: String,
    #[serde(default, alias = "level")]
    pub severity: Severity,
    #[serde(default, alias = "timestamp")]
    pub emitted_at_ms: Option<i64>,
}

impl LogEvent {
    pub fn new(
        entity_id: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            message: message.into(),
            severity,
            emitted_at_ms: None,
        }
    }

    pub fn is_terminal_sentinel(&self) -> bool {
        is_terminal_sentinel(&self.message)
    }
}

/// An ingested log line. `seq` is the only ordering key; `emitted_at_ms` comes
/// from the producer's clock and is kept for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: u64,
    pub entity_id: String,
    pub message: String,
    pub severity: Severity,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub emitted_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunLifecycle {
    #[default]
    Idle,
    Running,
    Stopping,
}

impl RunLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLifecycle::Idle => "idle",
            RunLifecycle::Running => "running",
            RunLifecycle::Stopping => "stopping",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RunLifecycle::Idle)
    }
}

impl fmt::Display for RunLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteResult {
    pub finished: bool,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RemoteResult {
    pub fn running(message: impl Into<String>) -> Self {
        Self {
            finished: false,
            success: false,
            message: message.into(),
            detail: None,
        }
    }

    pub fn succeeded(message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            finished: true,
            success: true,
            message: message.into(),
            detail,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            finished: true,
            success: false,
            message: message.into(),
            detail: None,
        }
    }
}

/// One authoritative poll of the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub results: HashMap<String, RemoteResult>,
}

impl StatusSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, entity_id: impl Into<String>, result: RemoteResult) -> Self {
        self.results.insert(entity_id.into(), result);
        self
    }
}

/// Batch configuration forwarded to the engine on start. The monitor does not
/// interpret any of it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StartParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_min_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomize_order: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl fmt::Debug for StartParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartParams")
            .field("concurrency", &self.concurrency)
            .field("retry_count", &self.retry_count)
            .field("delay_min_ms", &self.delay_min_ms)
            .field("delay_max_ms", &self.delay_max_ms)
            .field(
                "captcha_api_key",
                &self.captcha_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("randomize_order", &self.randomize_order)
            .field("invite_code", &self.invite_code)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom(
            "expected non-empty string or number for id",
        )),
    }
}
