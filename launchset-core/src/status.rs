use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Stopped,
    Launching,
    Online,
    Stopping,
    Errored,
}

impl ProcessStatus {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProcessStatus::Launching | ProcessStatus::Online | ProcessStatus::Stopping
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ProcessStatus::Stopped => "STOPPED",
            ProcessStatus::Launching => "LAUNCHING",
            ProcessStatus::Online => "ONLINE",
            ProcessStatus::Stopping => "STOPPING",
            ProcessStatus::Errored => "ERRORED",
        }
    }
}

/// Snapshot of one supervised process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub name: String,
    /// Fresh for every spawn, including restarts
    pub run_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub command: String,
}

impl ProcessInfo {
    pub fn stopped<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            run_id: None,
            pid: None,
            status: ProcessStatus::Stopped,
            restarts: 0,
            started_at: None,
            last_exit_code: None,
            command: command.into(),
        }
    }
}
