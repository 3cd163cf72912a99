use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::{ScheduleType, TaskStatus};

/// Sentinel `next_run` value marking a once-task as scheduled but not yet
/// confirmed finished. Written just before the task's container is spawned
/// and cleared back to `null` once `updateTaskAfterRun` runs.
pub const ONCE_TASK_SENTINEL: &str = "9999-01-01T00:00:00.000Z";

/// Scheduled task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(default)]
    pub id: Option<i64>,
    pub group_folder: String,
    /// Primary chat to reply to when this task runs.
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default = "default_context_mode")]
    pub context_mode: String,
    /// Additional group JIDs that also receive the task's result.
    #[serde(default)]
    pub extra_chat_jids: Vec<String>,
    /// Timestamp of the last time this task actually ran to completion or failure.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Truncated (<=200 char) summary of the last run's outcome.
    #[serde(default)]
    pub last_result: Option<String>,
}

fn default_context_mode() -> String {
    "group".to_string()
}

impl ScheduledTask {
    /// True if this row is a once-task that was picked up (next_run advanced
    /// to the sentinel) but crashed before `updateTaskAfterRun` could clear it.
    pub fn is_stuck(&self) -> bool {
        self.status == TaskStatus::Active
            && self.last_run.is_none()
            && self
                .next_run
                .is_some_and(|nr| nr.year() > 9990)
    }
}
