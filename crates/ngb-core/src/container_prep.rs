//! Pre-launch preparation for agent containers.
//!
//! Before spawning a container, the host must:
//! 1. Ensure group workspace directory exists
//! 2. Initialize .claude/settings.json (if first run)
//! 3. Sync shared skills from container/skills/ to group's .claude/skills/
//! 4. Write current_tasks.json snapshot to IPC directory
//! 5. Write available_groups.json snapshot to IPC directory
//! 6. Filter environment variables (only ANTHROPIC_API_KEY etc.)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ngb_config::Config;
use ngb_types::{NanoGridBotError, RegisteredGroup, Result, ScheduledTask};
use tracing::{debug, info};

/// Ensure the group workspace and IPC directories exist.
pub fn ensure_workspace_dirs(config: &Config, group_folder: &str) -> Result<PathBuf> {
    let group_dir = config.groups_dir.join(group_folder);
    std::fs::create_dir_all(&group_dir).map_err(|e| {
        NanoGridBotError::Container(format!(
            "Failed to create group dir {}: {e}",
            group_dir.display()
        ))
    })?;

    // Session state directory (.claude/)
    let sessions_dir = config.data_dir.join("sessions").join(group_folder);
    let claude_dir = sessions_dir.join(".claude");
    std::fs::create_dir_all(&claude_dir).map_err(|e| {
        NanoGridBotError::Container(format!(
            "Failed to create .claude dir {}: {e}",
            claude_dir.display()
        ))
    })?;

    // IPC directories
    let ipc_dir = config.data_dir.join("ipc").join(group_folder);
    for sub in ["messages", "tasks", "input"] {
        std::fs::create_dir_all(ipc_dir.join(sub)).map_err(|e| {
            NanoGridBotError::Container(format!(
                "Failed to create IPC dir {}/{sub}: {e}",
                ipc_dir.display()
            ))
        })?;
    }

    debug!(group = group_folder, "Group directories ensured");
    Ok(group_dir)
}

/// Initialize .claude/settings.json if it doesn't exist yet.
///
/// Creates a minimal settings file that allows the agent to run
/// with appropriate permissions inside the container.
pub fn init_settings_json(sessions_dir: &Path, group_folder: &str) -> Result<()> {
    let claude_dir = sessions_dir.join(group_folder).join(".claude");
    let settings_path = claude_dir.join("settings.json");

    if settings_path.exists() {
        debug!(
            group = group_folder,
            "settings.json already exists, skipping"
        );
        return Ok(());
    }

    std::fs::create_dir_all(&claude_dir)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to create .claude dir: {e}")))?;

    let settings = serde_json::json!({
        "permissions": {
            "allow": ["Bash", "Read", "Write", "Edit", "Glob", "Grep",
                      "WebSearch", "WebFetch", "Task", "TaskOutput", "TaskStop",
                      "NotebookEdit", "mcp__ngb__*"],
            "deny": []
        }
    });

    let content = serde_json::to_string_pretty(&settings)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to serialize settings: {e}")))?;

    std::fs::write(&settings_path, content).map_err(|e| {
        NanoGridBotError::Container(format!(
            "Failed to write settings.json at {}: {e}",
            settings_path.display()
        ))
    })?;

    info!(group = group_folder, "Initialized settings.json");
    Ok(())
}

/// Sync shared skills from container/skills/ to the group's .claude/skills/ directory.
pub fn sync_skills(skills_src: &Path, sessions_dir: &Path, group_folder: &str) -> Result<()> {
    if !skills_src.exists() {
        debug!("Skills source directory does not exist, skipping sync");
        return Ok(());
    }

    let target_dir = sessions_dir
        .join(group_folder)
        .join(".claude")
        .join("skills");
    std::fs::create_dir_all(&target_dir)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to create skills dir: {e}")))?;

    let entries = std::fs::read_dir(skills_src)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to read skills source: {e}")))?;

    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| {
            NanoGridBotError::Container(format!("Failed to read skills entry: {e}"))
        })?;
        let path = entry.path();
        if path.is_file() {
            let filename = path.file_name().unwrap();
            let dest = target_dir.join(filename);
            std::fs::copy(&path, &dest).map_err(|e| {
                NanoGridBotError::Container(format!("Failed to copy skill {}: {e}", path.display()))
            })?;
            count += 1;
        }
    }

    if count > 0 {
        debug!(group = group_folder, count, "Skills synced");
    }
    Ok(())
}

/// Write a snapshot of current tasks to the IPC directory.
pub fn write_tasks_snapshot(
    ipc_dir: &Path,
    group_folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
) -> Result<()> {
    let filtered: Vec<&ScheduledTask> = if is_main {
        tasks.iter().collect()
    } else {
        tasks
            .iter()
            .filter(|t| t.group_folder == group_folder)
            .collect()
    };

    let group_ipc = ipc_dir.join(group_folder);
    std::fs::create_dir_all(&group_ipc)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to create IPC dir: {e}")))?;

    let path = group_ipc.join("current_tasks.json");
    let content = serde_json::to_string_pretty(&filtered)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to serialize tasks: {e}")))?;

    std::fs::write(&path, content)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to write tasks snapshot: {e}")))?;

    debug!(
        group = group_folder,
        count = filtered.len(),
        "Tasks snapshot written"
    );
    Ok(())
}

/// Write a snapshot of available groups to the IPC directory.
pub fn write_workspaces_snapshot(
    ipc_dir: &Path,
    group_folder: &str,
    is_main: bool,
    groups: &[RegisteredGroup],
) -> Result<()> {
    // Only main group gets the full list
    if !is_main {
        return Ok(());
    }

    let group_ipc = ipc_dir.join(group_folder);
    std::fs::create_dir_all(&group_ipc)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to create IPC dir: {e}")))?;

    let path = group_ipc.join("available_groups.json");
    let content = serde_json::to_string_pretty(groups)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to serialize groups: {e}")))?;

    std::fs::write(&path, content).map_err(|e| {
        NanoGridBotError::Container(format!("Failed to write groups snapshot: {e}"))
    })?;

    debug!(
        group = group_folder,
        count = groups.len(),
        "Groups snapshot written"
    );
    Ok(())
}

/// Write a snapshot of the group queue's status to the IPC directory, for
/// the container's own `/status`-style introspection.
pub fn write_queue_status_snapshot(
    ipc_dir: &Path,
    group_folder: &str,
    is_main: bool,
    status_entries: &[crate::group_queue::GroupStatus],
    groups: &[RegisteredGroup],
) -> Result<()> {
    if !is_main {
        return Ok(());
    }

    let group_ipc = ipc_dir.join(group_folder);
    std::fs::create_dir_all(&group_ipc)
        .map_err(|e| NanoGridBotError::Container(format!("Failed to create IPC dir: {e}")))?;

    let folder_by_jid: HashMap<&str, &str> = groups
        .iter()
        .map(|g| (g.jid.as_str(), g.folder.as_str()))
        .collect();

    let entries: Vec<serde_json::Value> = status_entries
        .iter()
        .map(|s| {
            serde_json::json!({
                "groupJid": s.group_jid,
                "groupFolder": folder_by_jid.get(s.group_jid.as_str()).unwrap_or(&s.group_folder.as_str()),
                "activeMessage": s.active_message,
                "activeTask": s.active_task,
                "pendingMessages": s.pending_messages,
                "pendingTaskCount": s.pending_task_count,
                "retryCount": s.retry_count,
                "isBusy": s.is_busy,
            })
        })
        .collect();

    let path = group_ipc.join("queue_status.json");
    let content = serde_json::to_string_pretty(&entries).map_err(|e| {
        NanoGridBotError::Container(format!("Failed to serialize queue status: {e}"))
    })?;

    std::fs::write(&path, content).map_err(|e| {
        NanoGridBotError::Container(format!("Failed to write queue status snapshot: {e}"))
    })?;

    debug!(
        group = group_folder,
        count = entries.len(),
        "Queue status snapshot written"
    );
    Ok(())
}

/// Filter environment variables to only pass safe ones to the container.
pub fn filter_env_vars(config: &Config) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(ref key) = config.anthropic_api_key {
        env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
    }

    if let Some(ref key) = config.openai_api_key {
        env.insert("OPENAI_API_KEY".to_string(), key.clone());
    }

    env
}

/// Run all preparation steps before container launch.
///
/// Returns the filtered environment variables to pass to the container.
pub fn prepare_container_launch(
    config: &Config,
    group_folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
    groups: &[RegisteredGroup],
) -> Result<HashMap<String, String>> {
    // 1. Ensure directories
    ensure_workspace_dirs(config, group_folder)?;

    // 2. Init settings.json
    let sessions_dir = config.data_dir.join("sessions");
    init_settings_json(&sessions_dir, group_folder)?;

    // 3. Sync skills
    let skills_src = config.base_dir.join("container").join("skills");
    sync_skills(&skills_src, &sessions_dir, group_folder)?;

    // 4. Write tasks snapshot
    let ipc_dir = config.data_dir.join("ipc");
    write_tasks_snapshot(&ipc_dir, group_folder, is_main, tasks)?;

    // 5. Write groups snapshot
    write_workspaces_snapshot(&ipc_dir, group_folder, is_main, groups)?;

    // 6. Filter env vars
    let env = filter_env_vars(config);

    info!(
        group = group_folder,
        is_main,
        env_count = env.len(),
        "Container launch prepared"
    );
    Ok(env)
}
