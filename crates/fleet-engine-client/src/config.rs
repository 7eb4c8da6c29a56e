use std::env;
use std::path::PathBuf;
use std::time::Duration;

use fleet_core::engine_ipc::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineClientConfig {
    pub socket_path: PathBuf,
    pub client_id: String,
    pub request_timeout_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for EngineClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            client_id: format!("fleet-console-{}", std::process::id()),
            request_timeout_ms: 5_000,
            reconnect_max_ms: 10_000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl EngineClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(1_000))
    }
}

fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.trim().is_empty() {
            return PathBuf::from(runtime_dir).join("fleet").join("engine.sock");
        }
    }
    env::temp_dir().join("fleet-engine.sock")
}
