//! Newline-delimited JSON contract spoken with the remote automation engine.
//!
//! Every frame is one [`WireEnvelope`]. Requests carry a `request_id` that the
//! engine echoes on the matching `status` or `command_result` frame; `log`
//! frames are pushed unsolicited.

use crate::{LogEvent, RemoteResult, Severity, StartParams, StatusSnapshot, SYSTEM_ENTITY_ID};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

/// Message the engine reports for an account that is still being processed
/// when it does not send an explicit `finished` flag.
pub const LEGACY_RUNNING_MESSAGE: &str = "Running...";

fn current_version() -> u16 {
    CURRENT_PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default = "current_version")]
    pub version: u16,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Hello(HelloPayload),
    Log(LogEvent),
    StatusRequest(StatusRequestPayload),
    Status(StatusPayload),
    Command(CommandPayload),
    CommandResult(CommandResultPayload),
    RunFinished(RunFinishedPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRequestPayload {
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusPayload {
    #[serde(default)]
    pub epoch: Option<u64>,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub results: HashMap<String, WireTaskResult>,
}

impl StatusPayload {
    pub fn into_snapshot(self) -> StatusSnapshot {
        StatusSnapshot {
            is_running: self.is_running,
            results: self
                .results
                .into_iter()
                .map(|(entity_id, result)| (entity_id, result.into_remote_result()))
                .collect(),
        }
    }

    pub fn from_snapshot(epoch: Option<u64>, snapshot: &StatusSnapshot) -> Self {
        Self {
            epoch,
            is_running: snapshot.is_running,
            results: snapshot
                .results
                .iter()
                .map(|(entity_id, result)| (entity_id.clone(), WireTaskResult::from(result)))
                .collect(),
        }
    }
}

/// Per-account result as sent by the engine. Older engines omit `finished`
/// and name the detail `jwt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireTaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "jwt", skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WireTaskResult {
    pub fn into_remote_result(self) -> RemoteResult {
        let finished = self
            .finished
            .unwrap_or_else(|| self.success || self.message.trim() != LEGACY_RUNNING_MESSAGE);
        RemoteResult {
            finished,
            success: finished && self.success,
            message: self.message,
            detail: self.detail,
        }
    }
}

impl From<&RemoteResult> for WireTaskResult {
    fn from(result: &RemoteResult) -> Self {
        Self {
            finished: Some(result.finished),
            success: result.success,
            message: result.message.clone(),
            detail: result.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    Start,
    Stop,
}

impl EngineCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineCommand::Start => "start",
            EngineCommand::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandPayload {
    pub command: EngineCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StartParams>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Accepted,
    Rejected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResultPayload {
    pub command: EngineCommand,
    pub status: CommandStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    Stopped,
}

/// Structured end-of-run notice. Engines that send it need not also emit the
/// sentinel log line; clients fold it into one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunFinishedPayload {
    pub reason: FinishReason,
}

impl RunFinishedPayload {
    /// The equivalent sentinel log event.
    pub fn into_log_event(self) -> LogEvent {
        let (sentinel, severity) = match self.reason {
            FinishReason::Completed => ("All tasks completed", Severity::Success),
            FinishReason::Stopped => ("Run stopped by operator", Severity::Info),
        };
        LogEvent::new(SYSTEM_ENTITY_ID, sentinel, severity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let line = trim_line_ending(bytes);
    if line.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: line.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(line).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

/// Incremental decoder for a byte stream of NDJSON frames. A bad line is
/// reported and skipped; decoding continues with the next line.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            let line = trim_line_ending(&self.pending[consumed..end]);
            if !line.is_empty() {
                self.decode_line(line, &mut report);
            }
            consumed = end + 1;
        }
        self.pending.drain(..consumed);

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let rest = std::mem::take(&mut self.pending);
        let line = trim_line_ending(&rest);
        if !line.is_empty() {
            self.decode_line(line, &mut report);
        }
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport<T>) {
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_envelope(entity_id: &str, message: &str) -> WireEnvelope {
        WireEnvelope {
            version: CURRENT_PROTOCOL_VERSION,
            sender_id: "engine".to_string(),
            timestamp: "2026-10-16T09:00:00Z".to_string(),
            request_id: None,
            msg: WireMsg::Log(LogEvent::new(entity_id, message, Severity::Info)),
        }
    }

    #[test]
    fn start_command_round_trips_with_opaque_params() {
        let params: StartParams =
            serde_json::from_str(r#"{"concurrency":3,"invite_code":"abc","region":"eu"}"#)
                .expect("params");
        let envelope = WireEnvelope {
            request_id: Some("req-1".to_string()),
            msg: WireMsg::Command(CommandPayload {
                command: EngineCommand::Start,
                params: Some(params),
            }),
            ..log_envelope("SYSTEM", "unused")
        };

        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));
        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decoder_handles_split_chunks_and_recovers_after_garbage() {
        let first = encode_frame(&log_envelope("0xA", "one"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode first");
        let second = encode_frame(&log_envelope("0xB", "two"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode second");

        let mut stream = first.clone();
        stream.extend_from_slice(b"{\"type\":\"log\"\r\n");
        stream.extend_from_slice(&second);

        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let (head, tail) = stream.split_at(first.len() / 2);
        let report = decoder.push_chunk(head);
        assert!(report.frames.is_empty());
        assert!(decoder.buffered_len() > 0);

        let report = decoder.push_chunk(tail);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn decoder_drops_oversized_lines_and_unterminated_buffers() {
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(512);
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let valid = encode_frame(&log_envelope("0xA", "ok"), 512).expect("encode");
        let mut chunk = oversized.into_bytes();
        chunk.extend_from_slice(&valid);

        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 1);
        assert!(matches!(report.errors[0], FrameError::OversizedFrame { .. }));

        let report = decoder.push_chunk("y".repeat(600).as_bytes());
        assert!(matches!(report.errors[0], FrameError::OversizedBuffer { .. }));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn finish_decodes_trailing_frame_without_newline() {
        let frame = encode_frame(&log_envelope("0xA", "tail"), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::default();
        let report = decoder.push_chunk(&frame[..frame.len() - 1]);
        assert!(report.frames.is_empty());
        let report = decoder.finish();
        assert_eq!(report.frames.len(), 1);
    }

    #[test]
    fn missing_version_defaults_to_current() {
        let envelope: WireEnvelope = serde_json::from_str(
            r#"{"type":"status_request","sender_id":"c","timestamp":"t","payload":{"epoch":4}}"#,
        )
        .expect("parse");
        assert_eq!(envelope.version, CURRENT_PROTOCOL_VERSION);
        assert_eq!(
            envelope.msg,
            WireMsg::StatusRequest(StatusRequestPayload { epoch: 4 })
        );
    }

    #[test]
    fn legacy_results_map_to_remote_results() {
        let payload: StatusPayload = serde_json::from_str(
            r#"{
                "is_running": true,
                "results": {
                    "0xA": {"success": false, "message": "Running...", "jwt": null},
                    "0xB": {"success": true, "message": "Success! ID: 7", "jwt": "tok"},
                    "0xC": {"success": false, "message": "Login failed: banned"},
                    "0xD": {"finished": false, "success": false, "message": "Signing"}
                }
            }"#,
        )
        .expect("legacy payload");

        let snapshot = payload.into_snapshot();
        assert!(snapshot.is_running);
        assert_eq!(snapshot.results["0xA"], RemoteResult::running("Running..."));
        assert_eq!(
            snapshot.results["0xB"],
            RemoteResult::succeeded("Success! ID: 7", Some("tok".to_string()))
        );
        assert_eq!(
            snapshot.results["0xC"],
            RemoteResult::failed("Login failed: banned")
        );
        assert!(!snapshot.results["0xD"].finished);
    }

    #[test]
    fn run_finished_folds_into_sentinel() {
        let envelope: WireEnvelope = serde_json::from_str(
            r#"{"version":1,"type":"run_finished","sender_id":"engine","timestamp":"t","payload":{"reason":"stopped"}}"#,
        )
        .expect("parse");
        let WireMsg::RunFinished(payload) = envelope.msg else {
            panic!("expected run_finished")
        };
        let event = payload.into_log_event();
        assert_eq!(event.entity_id, SYSTEM_ENTITY_ID);
        assert!(event.is_terminal_sentinel());
    }
}
