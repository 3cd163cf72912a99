//! CRON/INTERVAL/ONCE task scheduler: the piece that decides when a
//! scheduled prompt is due, advances its `next_run` before the container
//! ever sees it, and drives the task-lane container run to completion.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use ngb_config::Config;
use ngb_db::{Database, GroupRepository, TaskRepository, TaskRunLogEntry};
use ngb_types::{
    ContainerEvent, NanoGridBotError, Result, ScheduleType, ScheduledTask, TaskStatus,
    ONCE_TASK_SENTINEL,
};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container_handle::{ContainerHandle, Lane};
use crate::container_prep::{write_queue_status_snapshot, write_tasks_snapshot};
use crate::container_runner::{run_container_streaming, ContainerInput};
use crate::group_queue::GroupQueue;
use crate::ipc::clear_reply_context;
use crate::ipc_handler::ChannelSender;
use crate::security::check_path_traversal;

/// How long a task-lane container is given to drain before `_close` is
/// armed, mirroring the message lane's own close-timer delay.
const TASK_CLOSE_DELAY: StdDuration = StdDuration::from_secs(10);

/// CRON/INTERVAL/ONCE task scheduler.
///
/// Periodically checks for due tasks and enqueues them onto the group
/// queue's task lane. A separate `drain_requested` flag lets callers force
/// an immediate poll (e.g. right after scheduling a new task) without
/// waiting out the configured interval.
pub struct TaskScheduler {
    db: Arc<Database>,
    queue: Arc<GroupQueue>,
    config: Config,
    channels: Arc<Vec<Box<dyn ChannelSender>>>,
    running: Arc<AtomicBool>,
    drain_requested: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    /// Create a new scheduler.
    pub fn new(
        db: Arc<Database>,
        queue: Arc<GroupQueue>,
        config: Config,
        channels: Arc<Vec<Box<dyn ChannelSender>>>,
    ) -> Self {
        Self {
            db,
            queue,
            config,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            drain_requested: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Start the scheduler background loop. Recovers stuck tasks once up
    /// front, then polls `get_due` every `scheduler_poll_interval_ms` (or
    /// immediately, whenever a drain is requested).
    pub fn start(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Scheduler is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let drain_requested = self.drain_requested.clone();
        let shutting_down = self.shutting_down.clone();
        let db = self.db.clone();
        let queue = self.queue.clone();
        let config = self.config.clone();
        let channels = self.channels.clone();
        let poll_interval = StdDuration::from_millis(self.config.scheduler_poll_interval_ms);

        let handle = tokio::spawn(async move {
            info!("Task scheduler started");

            if let Err(e) = recover_stuck_tasks(&db).await {
                error!(error = %e, "Failed to recover stuck tasks at startup");
            }

            while running.load(Ordering::SeqCst) {
                if shutting_down.load(Ordering::SeqCst) {
                    debug!("Scheduler shutting down, skipping tick dispatch");
                } else if let Err(e) =
                    check_and_enqueue_due_tasks(&db, &queue, &config, &channels).await
                {
                    error!(error = %e, "Scheduler tick failed");
                }

                if drain_requested.swap(false, Ordering::SeqCst) {
                    continue;
                }
                tokio::time::sleep(poll_interval).await;
            }
            info!("Task scheduler stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stop the scheduler.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        info!("Task scheduler stop requested");
    }

    /// Check if the scheduler is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip the shutting-down flag: the poll loop keeps running (so a tick
    /// already in flight finishes normally) but stops dispatching new due
    /// tasks onto the group queue's task lane.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Request an immediate poll on the next loop iteration instead of
    /// waiting out the configured interval.
    pub fn trigger_drain(&self) {
        self.drain_requested.store(true, Ordering::SeqCst);
    }

    /// Schedule a new task: calculate its next_run and save to DB.
    pub async fn schedule_task(&self, mut task: ScheduledTask) -> Result<i64> {
        task.next_run = calculate_next_run(&task)?;
        task.status = TaskStatus::Active;

        let repo = TaskRepository::new(&self.db);
        let id = repo.save_task(&task).await?;
        info!(task_id = id, next_run = ?task.next_run, "Task scheduled");
        Ok(id)
    }

    /// Cancel (delete) a task.
    pub async fn cancel_task(&self, task_id: i64) -> Result<bool> {
        let repo = TaskRepository::new(&self.db);
        let deleted = repo.delete_task(task_id).await?;
        if deleted {
            info!(task_id, "Task cancelled");
        }
        Ok(deleted)
    }

    /// Pause a task.
    pub async fn pause_task(&self, task_id: i64) -> Result<bool> {
        let repo = TaskRepository::new(&self.db);
        let updated = repo.update_status(task_id, TaskStatus::Paused).await?;
        if updated {
            info!(task_id, "Task paused");
        }
        Ok(updated)
    }

    /// Resume a paused task (re-calculate next_run).
    pub async fn resume_task(&self, task_id: i64) -> Result<bool> {
        let repo = TaskRepository::new(&self.db);
        if let Some(mut task) = repo.get_task(task_id).await? {
            task.status = TaskStatus::Active;
            task.next_run = calculate_next_run(&task)?;
            repo.save_task(&task).await?;
            info!(task_id, next_run = ?task.next_run, "Task resumed");
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Reset tasks that were interrupted mid-flight (`next_run` still pinned to
/// the in-flight sentinel with no recorded run) so the next poll picks them
/// back up, rather than leaving them stranded forever.
async fn recover_stuck_tasks(db: &Database) -> Result<()> {
    let repo = TaskRepository::new(db);
    let stuck = repo.get_stuck().await?;
    if stuck.is_empty() {
        return Ok(());
    }

    warn!(count = stuck.len(), "Recovering stuck tasks");
    for task in stuck {
        let Some(task_id) = task.id else { continue };
        repo.update_next_run(task_id, Utc::now()).await?;
    }
    Ok(())
}

/// Check for due tasks and enqueue them onto the task lane.
async fn check_and_enqueue_due_tasks(
    db: &Arc<Database>,
    queue: &Arc<GroupQueue>,
    config: &Config,
    channels: &Arc<Vec<Box<dyn ChannelSender>>>,
) -> Result<()> {
    let repo = TaskRepository::new(db);
    let due_tasks = repo.get_due().await?;

    if due_tasks.is_empty() {
        return Ok(());
    }

    debug!(count = due_tasks.len(), "Found due tasks");

    for task in due_tasks {
        let Some(task_id) = task.id else { continue };

        // The row may have been paused or cancelled by an operator between
        // `get_due` selecting it and this dispatch, especially when a
        // single tick enumerates many due tasks back to back.
        match repo.get_task(task_id).await {
            Ok(Some(fresh)) if fresh.status == TaskStatus::Active => {}
            Ok(Some(_)) => {
                debug!(task_id, "Task no longer active since selection, skipping");
                continue;
            }
            Ok(None) => {
                debug!(task_id, "Task deleted since selection, skipping");
                continue;
            }
            Err(e) => {
                warn!(task_id, error = %e, "Failed to re-read task before dispatch, skipping");
                continue;
            }
        }

        let chat_jid = task.chat_jid.clone();
        let group_folder = task.group_folder.clone();

        let db = db.clone();
        let queue_for_work = queue.clone();
        let config_for_work = config.clone();
        let channels_for_work = channels.clone();
        let task_for_work = task.clone();

        queue
            .enqueue_task(
                &chat_jid,
                &group_folder,
                task_id,
                Box::new(move || {
                    Box::pin(async move {
                        run_task(
                            &db,
                            &queue_for_work,
                            &config_for_work,
                            &channels_for_work,
                            task_for_work,
                        )
                        .await
                    })
                }),
            )
            .await;
    }

    Ok(())
}

/// Run a single due task to completion: validate, advance `next_run`,
/// snapshot the group's IPC state, spawn the task-lane container, relay
/// textual results, and log the outcome. Returns `true` iff the container
/// exited cleanly.
async fn run_task(
    db: &Arc<Database>,
    queue: &Arc<GroupQueue>,
    config: &Config,
    channels: &Arc<Vec<Box<dyn ChannelSender>>>,
    task: ScheduledTask,
) -> bool {
    let repo = TaskRepository::new(db);
    let task_id = task.id.unwrap_or(0);
    let run_at = Utc::now();

    if check_path_traversal(&task.group_folder) {
        error!(task_id, group_folder = %task.group_folder, "Invalid group folder, pausing task");
        let _ = repo.update_status(task_id, TaskStatus::Paused).await;
        log_error_run(&repo, task_id, run_at, "invalid group folder").await;
        return false;
    }

    let next_run = match calculate_next_run_advance(&task) {
        Ok(v) => v,
        Err(e) => {
            error!(task_id, error = %e, "Failed to compute next_run");
            log_error_run(&repo, task_id, run_at, &e.to_string()).await;
            return false;
        }
    };
    if let Some(next) = next_run {
        if let Err(e) = repo.update_next_run(task_id, next).await {
            error!(task_id, error = %e, "Failed to persist advanced next_run, aborting run");
            return false;
        }
    }

    let group_repo = GroupRepository::new(db);
    let group = match group_repo.get_group(&task.chat_jid).await {
        Ok(Some(g)) => g,
        Ok(None) => {
            error!(task_id, chat_jid = %task.chat_jid, "Group not registered, skipping run");
            log_error_run(&repo, task_id, run_at, "group not registered").await;
            return false;
        }
        Err(e) => {
            error!(task_id, error = %e, "Failed to look up registered group");
            log_error_run(&repo, task_id, run_at, &e.to_string()).await;
            return false;
        }
    };

    let ipc_dir = config.data_dir.join("ipc");
    let is_main = task.group_folder == config.main_group_folder;
    let all_tasks = repo.get_active().await.unwrap_or_default();
    if let Err(e) = write_tasks_snapshot(&ipc_dir, &task.group_folder, is_main, &all_tasks) {
        warn!(task_id, error = %e, "Failed to write tasks snapshot");
    }
    let status = queue.get_status().await;
    let all_groups = group_repo.get_all().await.unwrap_or_default();
    if let Err(e) =
        write_queue_status_snapshot(&ipc_dir, &task.group_folder, is_main, &status, &all_groups)
    {
        warn!(task_id, error = %e, "Failed to write queue status snapshot");
    }

    if let Err(e) = clear_reply_context(&config.data_dir, &task.group_folder).await {
        warn!(task_id, error = %e, "Failed to clear stale reply context");
    }

    let input = ContainerInput {
        prompt: task.prompt.clone(),
        session_id: None,
        group_folder: task.group_folder.clone(),
        chat_jid: task.chat_jid.clone(),
        is_main,
        is_scheduled_task: true,
        assistant_name: Some(config.assistant_name.clone()),
    };

    let additional_mounts = group
        .container_config
        .as_ref()
        .and_then(|c| c.get("additional_mounts"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_object())
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let chat_jid = task.chat_jid.clone();
    let extra_jids = task.extra_chat_jids.clone();
    let channels_for_output = channels.clone();
    let queue_for_output = queue.clone();
    let error_holder: Arc<tokio::sync::Mutex<Option<String>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let error_holder_cb = error_holder.clone();

    let on_output: crate::container_runner::OnOutputHook = Box::new(move |event: ContainerEvent| {
        let channels = channels_for_output.clone();
        let queue = queue_for_output.clone();
        let chat_jid = chat_jid.clone();
        let extra_jids = extra_jids.clone();
        let error_holder = error_holder_cb.clone();
        Box::pin(async move {
            match &event {
                ContainerEvent::Success { .. } => {
                    if let Some(text) = event.text() {
                        let cleaned = text.trim();
                        if !cleaned.is_empty() {
                            deliver_to_jids(&channels, &chat_jid, &extra_jids, cleaned).await;
                        }
                    }
                    queue.notify_task_idle(&chat_jid).await;
                    queue.arm_close_timer(&chat_jid, TASK_CLOSE_DELAY).await;
                }
                ContainerEvent::Error { message } => {
                    *error_holder.lock().await = Some(message.clone());
                    queue.arm_close_timer(&chat_jid, TASK_CLOSE_DELAY).await;
                }
            }
        })
    });

    let queue_for_process = queue.clone();
    let group_jid_for_process = task.chat_jid.clone();
    let group_folder_for_process = task.group_folder.clone();
    let on_process: crate::container_runner::OnProcessHook = Box::new(move |pid, name| {
        let queue = queue_for_process.clone();
        let group_jid = group_jid_for_process.clone();
        let handle = ContainerHandle::new(
            group_jid.clone(),
            Lane::Task,
            group_folder_for_process.clone(),
            name,
            pid,
        );
        tokio::spawn(async move {
            queue.set_task_handle(&group_jid, handle).await;
        });
    });

    let result = run_container_streaming(
        &input,
        &additional_mounts,
        Some(config.container_timeout),
        &HashMap::new(),
        config,
        db,
        on_process,
        on_output,
    )
    .await;

    queue.cancel_close_timer(&task.chat_jid).await;

    let duration_ms = (Utc::now() - run_at).num_milliseconds();
    let (success, status_str, result_text, error_text) = match &result {
        Ok(output) if output.is_success() => {
            (true, "success", output.result.clone(), None)
        }
        Ok(output) => (
            false,
            "error",
            None,
            output.error.clone().or_else(|| error_holder_snapshot(&error_holder)),
        ),
        Err(e) => (false, "error", None, Some(e.to_string())),
    };

    let log_entry = TaskRunLogEntry {
        task_id,
        run_at,
        duration_ms: Some(duration_ms),
        status: status_str.to_string(),
        result: result_text.clone(),
        error: error_text.clone(),
    };
    if let Err(e) = repo.log_task_run(&log_entry).await {
        warn!(task_id, error = %e, "Failed to write task run log");
    }

    let final_next_run = calculate_final_next_run(&task).unwrap_or(None);
    let summary = result_text
        .or(error_text)
        .unwrap_or_else(|| status_str.to_string());
    if let Err(e) = repo
        .update_task_after_run(task_id, final_next_run, run_at, &summary)
        .await
    {
        error!(task_id, error = %e, "Failed to persist task run result");
    }

    success
}

fn error_holder_snapshot(holder: &Arc<tokio::sync::Mutex<Option<String>>>) -> Option<String> {
    holder.try_lock().ok().and_then(|g| g.clone())
}

async fn deliver_to_jids(
    channels: &Arc<Vec<Box<dyn ChannelSender>>>,
    chat_jid: &str,
    extra_jids: &[String],
    text: &str,
) {
    let mut targets: Vec<&str> = vec![chat_jid];
    targets.extend(extra_jids.iter().map(|s| s.as_str()));

    for jid in targets {
        for ch in channels.iter() {
            if ch.owns_jid(jid) {
                if let Err(e) = ch.send_message(jid, text, None).await {
                    warn!(jid, error = %e, "Failed to relay task result to chat");
                }
                break;
            }
        }
    }
}

async fn log_error_run(repo: &TaskRepository<'_>, task_id: i64, run_at: DateTime<Utc>, msg: &str) {
    let entry = TaskRunLogEntry {
        task_id,
        run_at,
        duration_ms: None,
        status: "error".to_string(),
        result: None,
        error: Some(msg.to_string()),
    };
    let _ = repo.log_task_run(&entry).await;
}

/// `next_run` to persist *before* the container is invoked: for cron and
/// interval tasks this is the real next occurrence (so a second copy of the
/// same task never runs concurrently); for a one-shot task it is the
/// in-flight sentinel.
fn calculate_next_run_advance(task: &ScheduledTask) -> Result<Option<DateTime<Utc>>> {
    match task.schedule_type {
        ScheduleType::Cron => calculate_cron_next(&task.schedule_value),
        ScheduleType::Interval => calculate_interval_next(&task.schedule_value),
        ScheduleType::Once => Ok(Some(
            ONCE_TASK_SENTINEL
                .parse()
                .expect("ONCE_TASK_SENTINEL is a valid RFC3339 timestamp"),
        )),
    }
}

/// `next_run` to persist *after* the container exits: recurring tasks get
/// their next real occurrence recomputed from now; a one-shot task is done.
fn calculate_final_next_run(task: &ScheduledTask) -> Result<Option<DateTime<Utc>>> {
    match task.schedule_type {
        ScheduleType::Cron => calculate_cron_next(&task.schedule_value),
        ScheduleType::Interval => calculate_interval_next(&task.schedule_value),
        ScheduleType::Once => Ok(None),
    }
}

/// Calculate the next run time for a task based on its schedule type. Used
/// when a task is first scheduled or resumed, before any run has happened.
pub fn calculate_next_run(task: &ScheduledTask) -> Result<Option<DateTime<Utc>>> {
    match task.schedule_type {
        ScheduleType::Cron => calculate_cron_next(&task.schedule_value),
        ScheduleType::Interval => calculate_interval_next(&task.schedule_value),
        ScheduleType::Once => {
            if let Some(next) = task.next_run {
                if next > Utc::now() {
                    Ok(Some(next))
                } else {
                    Ok(Some(Utc::now()))
                }
            } else {
                Ok(Some(Utc::now()))
            }
        }
    }
}

/// Convert 5-field cron to 7-field and calculate next occurrence.
///
/// Rust `cron` crate uses 7-field format: sec min hour dom month dow year.
/// Standard user input is 5-field: min hour dom month dow.
/// We prepend "0" (second) and append "*" (year).
fn calculate_cron_next(expr: &str) -> Result<Option<DateTime<Utc>>> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = fields.join(" ");
    let cron_expr = match fields.len() {
        5 => format!("0 {normalized} *"), // 5→7: prepend sec, append year
        6 => format!("{normalized} *"),   // 6→7: append year
        7 => normalized,                  // Already 7-field
        _ => {
            return Err(NanoGridBotError::Config(format!(
                "Invalid cron expression (expected 5-7 fields): {expr}"
            )));
        }
    };

    let schedule = cron::Schedule::from_str(&cron_expr).map_err(|e| {
        NanoGridBotError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
    })?;

    Ok(schedule.upcoming(Utc).next())
}

/// Parse interval expressions like "60s", "5m", "2h", "1d".
fn calculate_interval_next(value: &str) -> Result<Option<DateTime<Utc>>> {
    let re = Regex::new(r"^(\d+)([smhd])$").unwrap();
    if let Some(caps) = re.captures(value.trim()) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| NanoGridBotError::Config(format!("Invalid interval amount: {value}")))?;

        let duration = match &caps[2] {
            "s" => Duration::seconds(amount),
            "m" => Duration::minutes(amount),
            "h" => Duration::hours(amount),
            "d" => Duration::days(amount),
            _ => unreachable!(),
        };

        Ok(Some(Utc::now() + duration))
    } else if let Ok(secs) = value.trim().parse::<i64>() {
        Ok(Some(Utc::now() + Duration::seconds(secs)))
    } else {
        Err(NanoGridBotError::Config(format!(
            "Invalid interval expression: {value}. Expected format: 60s, 5m, 2h, 1d"
        )))
    }
}
