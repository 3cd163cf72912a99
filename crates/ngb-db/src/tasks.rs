use chrono::{DateTime, Utc};

use ngb_types::{NanoGridBotError, Result, ScheduleType, ScheduledTask, TaskStatus};

use crate::connection::Database;

/// One row of the append-only task-run log: a record of a single execution
/// of a scheduled task, kept even after the task itself is edited or deleted.
#[derive(Debug, Clone)]
pub struct TaskRunLogEntry {
    pub task_id: i64,
    pub run_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Repository for scheduled task storage and retrieval.
pub struct TaskRepository<'a> {
    db: &'a Database,
}

impl<'a> TaskRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Save or update a task. Returns the task ID.
    pub async fn save_task(&self, task: &ScheduledTask) -> Result<i64> {
        let schedule_type = serde_json::to_value(task.schedule_type)
            .unwrap()
            .as_str()
            .unwrap_or("cron")
            .to_string();
        let status = serde_json::to_value(task.status)
            .unwrap()
            .as_str()
            .unwrap_or("active")
            .to_string();
        let next_run = task.next_run.map(|dt| dt.to_rfc3339());
        let last_run = task.last_run.map(|dt| dt.to_rfc3339());
        let extra_chat_jids = serde_json::to_string(&task.extra_chat_jids)
            .map_err(|e| NanoGridBotError::Database(format!("Serialize extra_chat_jids: {e}")))?;

        if task.id.is_none() {
            let result = sqlx::query(
                "INSERT INTO tasks
                 (group_folder, chat_jid, prompt, schedule_type, schedule_value, status,
                  next_run, context_mode, extra_chat_jids, last_run, last_result)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task.group_folder)
            .bind(&task.chat_jid)
            .bind(&task.prompt)
            .bind(&schedule_type)
            .bind(&task.schedule_value)
            .bind(&status)
            .bind(&next_run)
            .bind(&task.context_mode)
            .bind(&extra_chat_jids)
            .bind(&last_run)
            .bind(&task.last_result)
            .execute(self.db.pool())
            .await
            .map_err(|e| NanoGridBotError::Database(format!("Insert task: {e}")))?;

            Ok(result.last_insert_rowid())
        } else {
            sqlx::query(
                "UPDATE tasks
                 SET group_folder = ?, chat_jid = ?, prompt = ?, schedule_type = ?, schedule_value = ?,
                     status = ?, next_run = ?, context_mode = ?, extra_chat_jids = ?,
                     last_run = ?, last_result = ?
                 WHERE id = ?",
            )
            .bind(&task.group_folder)
            .bind(&task.chat_jid)
            .bind(&task.prompt)
            .bind(&schedule_type)
            .bind(&task.schedule_value)
            .bind(&status)
            .bind(&next_run)
            .bind(&task.context_mode)
            .bind(&extra_chat_jids)
            .bind(&last_run)
            .bind(&task.last_result)
            .bind(task.id.unwrap())
            .execute(self.db.pool())
            .await
            .map_err(|e| NanoGridBotError::Database(format!("Update task: {e}")))?;

            Ok(task.id.unwrap())
        }
    }

    /// Advance `next_run` and optionally record `last_run`/`last_result` in a single
    /// write, matching the scheduler's `updateTaskAfterRun` contract.
    pub async fn update_task_after_run(
        &self,
        task_id: i64,
        next_run: Option<DateTime<Utc>>,
        last_run: DateTime<Utc>,
        last_result: &str,
    ) -> Result<bool> {
        let next_run_str = next_run.map(|dt| dt.to_rfc3339());
        let truncated: String = last_result.chars().take(200).collect();

        let result = sqlx::query(
            "UPDATE tasks SET next_run = ?, last_run = ?, last_result = ? WHERE id = ?",
        )
        .bind(&next_run_str)
        .bind(last_run.to_rfc3339())
        .bind(&truncated)
        .bind(task_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Update task after run: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Append a row to the task-run log.
    pub async fn log_task_run(&self, entry: &TaskRunLogEntry) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO task_run_log (task_id, run_at, duration_ms, status, result, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.task_id)
        .bind(entry.run_at.to_rfc3339())
        .bind(entry.duration_ms)
        .bind(&entry.status)
        .bind(&entry.result)
        .bind(&entry.error)
        .execute(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Insert task_run_log: {e}")))?;

        Ok(result.last_insert_rowid())
    }

    /// Get a task by ID.
    pub async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get task: {e}")))?;

        row.map(row_to_task).transpose()
    }

    /// Get all active tasks.
    pub async fn get_active(&self) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks WHERE status = 'active'
             ORDER BY next_run ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get active tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Get all tasks.
    pub async fn get_all(&self) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks ORDER BY next_run ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get all tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Get tasks by group folder.
    pub async fn get_by_group(&self, group_folder: &str) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks WHERE group_folder = ?
             ORDER BY next_run ASC",
        )
        .bind(group_folder)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get tasks by group: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Update task status.
    pub async fn update_status(&self, task_id: i64, status: TaskStatus) -> Result<bool> {
        let status_str = serde_json::to_value(status)
            .unwrap()
            .as_str()
            .unwrap_or("active")
            .to_string();

        let result = sqlx::query("UPDATE tasks SET status = ? WHERE id = ?")
            .bind(&status_str)
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| NanoGridBotError::Database(format!("Update task status: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Update task next run time.
    pub async fn update_next_run(&self, task_id: i64, next_run: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET next_run = ? WHERE id = ?")
            .bind(next_run.to_rfc3339())
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| NanoGridBotError::Database(format!("Update next run: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a task.
    pub async fn delete_task(&self, task_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(self.db.pool())
            .await
            .map_err(|e| NanoGridBotError::Database(format!("Delete task: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Get tasks that are due to run (active + next_run <= now).
    pub async fn get_due(&self) -> Result<Vec<ScheduledTask>> {
        let now = Utc::now().to_rfc3339();
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks
             WHERE status = 'active' AND next_run <= ?
             ORDER BY next_run ASC",
        )
        .bind(&now)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get due tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// Scan for stuck once-tasks: `status=active ∧ last_run=null ∧ next_run > '9990'`.
    /// These were advanced to the sentinel before a crash and never completed.
    pub async fn get_stuck(&self) -> Result<Vec<ScheduledTask>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    status, next_run, context_mode, extra_chat_jids, last_run, last_result
             FROM tasks
             WHERE status = 'active' AND last_run IS NULL AND next_run > '9990'",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| NanoGridBotError::Database(format!("Get stuck tasks: {e}")))?;

        rows.into_iter().map(row_to_task).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    group_folder: String,
    chat_jid: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    status: String,
    next_run: Option<String>,
    context_mode: String,
    extra_chat_jids: String,
    last_run: Option<String>,
    last_result: Option<String>,
}

fn row_to_task(row: TaskRow) -> Result<ScheduledTask> {
    let schedule_type = match row.schedule_type.as_str() {
        "interval" => ScheduleType::Interval,
        "once" => ScheduleType::Once,
        _ => ScheduleType::Cron,
    };
    let status = match row.status.as_str() {
        "paused" => TaskStatus::Paused,
        "completed" => TaskStatus::Completed,
        _ => TaskStatus::Active,
    };
    let next_run = row
        .next_run
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let last_run = row
        .last_run
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let extra_chat_jids: Vec<String> = serde_json::from_str(&row.extra_chat_jids)
        .map_err(|e| NanoGridBotError::Database(format!("Parse extra_chat_jids: {e}")))?;

    Ok(ScheduledTask {
        id: Some(row.id),
        group_folder: row.group_folder,
        chat_jid: row.chat_jid,
        prompt: row.prompt,
        schedule_type,
        schedule_value: row.schedule_value,
        status,
        next_run,
        context_mode: row.context_mode,
        extra_chat_jids,
        last_run,
        last_result: row.last_result,
    })
}
