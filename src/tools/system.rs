//! Built-in device and system queries

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::{ToolBridge, ToolOutcome};

/// Audio activity flags, updated by the orchestrator and read by tools
#[derive(Debug, Default)]
pub struct AudioActivity {
    capturing: AtomicBool,
    playing: AtomicBool,
}

impl AudioActivity {
    pub fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::Release);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    hostname: String,
    os: &'static str,
    arch: &'static str,
    cpus: usize,
}

#[derive(Debug, Serialize)]
struct DeviceStatus {
    uptime_secs: u64,
    capturing: bool,
    playing: bool,
}

/// Answers `get_system_info`, `get_device_status` and `get_current_time`
#[derive(Debug, Clone)]
pub struct SystemTools {
    started: Instant,
    activity: Arc<AudioActivity>,
}

impl SystemTools {
    #[must_use]
    pub fn new(activity: Arc<AudioActivity>) -> Self {
        Self {
            started: Instant::now(),
            activity,
        }
    }

    fn system_info() -> SystemInfo {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        SystemInfo {
            hostname,
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }

    fn device_status(&self) -> DeviceStatus {
        DeviceStatus {
            uptime_secs: self.started.elapsed().as_secs(),
            capturing: self.activity.is_capturing(),
            playing: self.activity.is_playing(),
        }
    }
}

impl ToolBridge for SystemTools {
    fn call(&self, name: &str, _arguments: &Value) -> ToolOutcome {
        let encoded = match name {
            "get_system_info" => serde_json::to_string(&Self::system_info()),
            "get_device_status" => serde_json::to_string(&self.device_status()),
            "get_current_time" => return ToolOutcome::ok(chrono::Local::now().to_rfc3339()),
            other => {
                tracing::warn!(tool = other, "agent called an unknown tool");
                return ToolOutcome::error(format!("unknown tool: {other}"));
            }
        };

        match encoded {
            Ok(json) => ToolOutcome::ok(json),
            Err(e) => ToolOutcome::error(format!("failed to encode {name} result: {e}")),
        }
    }
}
