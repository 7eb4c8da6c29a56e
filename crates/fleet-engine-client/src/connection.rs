use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use fleet_core::engine_ipc::{HelloPayload, WireEnvelope, WireMsg, CURRENT_PROTOCOL_VERSION};
use fleet_core::LogEvent;
use fleet_monitor::LogSink;
use tokio::sync::{oneshot, watch};
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// State shared between the client handles and the connection task.
pub(crate) struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<WireMsg>>>,
    sinks: Mutex<Vec<(u64, LogSink)>>,
    next_sink_id: AtomicU64,
    connected: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (connected, connected_rx) = watch::channel(false);
        let shared = Self {
            pending: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            next_sink_id: AtomicU64::new(1),
            connected,
        };
        (shared, connected_rx)
    }

    pub(crate) fn register(&self, request_id: String, reply: oneshot::Sender<WireMsg>) {
        lock(&self.pending).insert(request_id, reply);
    }

    pub(crate) fn forget(&self, request_id: &str) {
        lock(&self.pending).remove(request_id);
    }

    fn resolve(&self, request_id: &str, msg: WireMsg) -> bool {
        match lock(&self.pending).remove(request_id) {
            Some(reply) => reply.send(msg).is_ok(),
            None => false,
        }
    }

    /// Drops every outstanding reply slot; waiting requests see the
    /// connection as closed.
    fn fail_pending(&self) -> usize {
        let mut pending = lock(&self.pending);
        let count = pending.len();
        pending.clear();
        count
    }

    pub(crate) fn add_sink(&self, sink: LogSink) -> u64 {
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.sinks).push((id, sink));
        id
    }

    pub(crate) fn remove_sink(&self, id: u64) {
        lock(&self.sinks).retain(|(sink_id, _)| *sink_id != id);
    }

    fn dispatch_log(&self, event: LogEvent) {
        lock(&self.sinks).retain(|(_, sink)| sink.emit(event.clone()));
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

pub(crate) fn envelope(sender_id: &str, request_id: Option<String>, msg: WireMsg) -> WireEnvelope {
    WireEnvelope {
        version: CURRENT_PROTOCOL_VERSION,
        sender_id: sender_id.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        request_id,
        msg,
    }
}

fn hello(sender_id: &str) -> WireEnvelope {
    envelope(
        sender_id,
        None,
        WireMsg::Hello(HelloPayload {
            client_id: sender_id.to_string(),
            role: "monitor".to_string(),
            capabilities: vec![
                "log".to_string(),
                "status".to_string(),
                "command".to_string(),
            ],
        }),
    )
}

fn route_frame(shared: &Shared, envelope: WireEnvelope) {
    if envelope.version > CURRENT_PROTOCOL_VERSION {
        debug!(event = "engine_frame_version_skipped", version = envelope.version);
        return;
    }
    match envelope.msg {
        WireMsg::Log(event) => shared.dispatch_log(event),
        WireMsg::RunFinished(payload) => {
            debug!(event = "engine_run_finished", reason = ?payload.reason);
            shared.dispatch_log(payload.into_log_event());
        }
        msg @ (WireMsg::Status(_) | WireMsg::CommandResult(_)) => match envelope.request_id {
            Some(request_id) => {
                if !shared.resolve(&request_id, msg) {
                    debug!(event = "engine_reply_unmatched", request_id = %request_id);
                }
            }
            None => debug!(event = "engine_reply_without_request_id"),
        },
        WireMsg::Hello(payload) => {
            debug!(event = "engine_hello", engine_id = %payload.client_id, role = %payload.role);
        }
        WireMsg::StatusRequest(_) | WireMsg::Command(_) => {
            debug!(event = "engine_frame_unexpected", sender_id = %envelope.sender_id);
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

#[cfg(not(unix))]
pub(crate) async fn connection_loop(
    _config: crate::EngineClientConfig,
    shared: std::sync::Arc<Shared>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<WireEnvelope>,
) {
    shared.set_connected(false);
    while outbound_rx.recv().await.is_some() {
        shared.fail_pending();
    }
}

#[cfg(unix)]
pub(crate) async fn connection_loop(
    config: crate::EngineClientConfig,
    shared: std::sync::Arc<Shared>,
    mut outbound_rx: tokio::sync::mpsc::Receiver<WireEnvelope>,
) {
    use fleet_core::engine_ipc::NdjsonFrameDecoder;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::net::UnixStream;
    use tracing::{info, warn};

    let max_backoff = config.reconnect_max();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let stream = match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(
                    event = "engine_connect_failed",
                    socket = %config.socket_path.display(),
                    error = %err
                );
                drop_queued(&mut outbound_rx);
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, max_backoff);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        let (reader_half, mut writer_half) = stream.into_split();
        drop_queued(&mut outbound_rx);
        if let Err(err) =
            send_wire_envelope(&mut writer_half, &hello(&config.client_id), config.max_frame_bytes)
                .await
        {
            warn!(event = "engine_hello_failed", error = %err);
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff, max_backoff);
            continue;
        }
        shared.set_connected(true);
        info!(event = "engine_connected", socket = %config.socket_path.display());

        let mut reader = BufReader::new(reader_half);
        let mut decoder = NdjsonFrameDecoder::<WireEnvelope>::new(config.max_frame_bytes);
        let mut read_buf = [0u8; 8192];

        loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    let read = match read {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "engine_read_failed", error = %err);
                            break;
                        }
                    };
                    if read == 0 {
                        break;
                    }
                    let report = decoder.push_chunk(&read_buf[..read]);
                    for err in report.errors {
                        warn!(event = "engine_frame_decode_failed", error = %err);
                    }
                    for envelope in report.frames {
                        route_frame(&shared, envelope);
                    }
                }
                outbound = outbound_rx.recv() => {
                    let Some(envelope) = outbound else {
                        shared.set_connected(false);
                        return;
                    };
                    if let Err(err) =
                        send_wire_envelope(&mut writer_half, &envelope, config.max_frame_bytes).await
                    {
                        warn!(event = "engine_write_failed", error = %err);
                        break;
                    }
                }
            }
        }

        let final_report = decoder.finish();
        for err in final_report.errors {
            warn!(event = "engine_frame_decode_failed", error = %err);
        }
        for envelope in final_report.frames {
            route_frame(&shared, envelope);
        }
        shared.set_connected(false);
        let failed = shared.fail_pending();
        drop_queued(&mut outbound_rx);
        warn!(
            event = "engine_disconnected",
            failed_requests = failed,
            retry_in_ms = backoff.as_millis() as u64
        );
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, max_backoff);
    }
}

/// Requests queued while the connection was down must not reach a later
/// connection: their callers have already been failed.
#[cfg(unix)]
fn drop_queued(outbound_rx: &mut tokio::sync::mpsc::Receiver<WireEnvelope>) {
    while outbound_rx.try_recv().is_ok() {}
}

#[cfg(unix)]
async fn send_wire_envelope(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    envelope: &WireEnvelope,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    use fleet_core::engine_ipc::encode_frame;
    use tokio::io::AsyncWriteExt;

    let frame = encode_frame(envelope, max_frame_bytes)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
