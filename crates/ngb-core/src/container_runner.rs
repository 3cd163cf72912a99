use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use ngb_config::Config;
use ngb_db::{Database, MetricsRepository};
use ngb_types::{ContainerEvent, ContainerOutput, NanoGridBotError, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::mount_security::validate_group_mounts;

/// Marker written by the agent container to delimit its JSON output.
pub const OUTPUT_START_MARKER: &str = "---NGB_OUTPUT_START---";
/// End marker.
pub const OUTPUT_END_MARKER: &str = "---NGB_OUTPUT_END---";

/// Run an agent container and return its output.
///
/// Flow: validate mounts → merge env → build docker command →
/// execute with timeout → parse output → record metrics.
#[allow(clippy::too_many_arguments)]
pub async fn run_container_agent(
    group_folder: &str,
    prompt: &str,
    session_id: &str,
    chat_jid: &str,
    is_main: bool,
    additional_mounts: &[HashMap<String, serde_json::Value>],
    timeout_secs: Option<u64>,
    env: &HashMap<String, String>,
    config: &Config,
    db: &Database,
) -> Result<ContainerOutput> {
    let metrics = MetricsRepository::new(db);
    let channel = chat_jid.split(':').next().unwrap_or("unknown");
    let metric_id = metrics
        .record_container_start(group_folder, channel)
        .await?;
    let start = Instant::now();

    let result = run_container_inner(
        group_folder,
        prompt,
        session_id,
        chat_jid,
        is_main,
        additional_mounts,
        timeout_secs,
        env,
        config,
    )
    .await;

    let duration = start.elapsed().as_secs_f64();

    match &result {
        Ok(output) => {
            info!(
                group_folder,
                status = %output.status,
                duration_secs = duration,
                "Container execution completed"
            );
            metrics
                .record_container_end(metric_id, &output.status, Some(duration), None, None, None)
                .await?;
        }
        Err(e) => {
            error!(group_folder, error = %e, "Container execution failed");
            let status = if matches!(e, NanoGridBotError::Timeout(_)) {
                "timeout"
            } else {
                "error"
            };
            metrics
                .record_container_end(
                    metric_id,
                    status,
                    Some(duration),
                    None,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
        }
    }

    result
}

/// Inner function that handles the actual container invocation.
#[allow(clippy::too_many_arguments)]
async fn run_container_inner(
    group_folder: &str,
    prompt: &str,
    session_id: &str,
    chat_jid: &str,
    is_main: bool,
    additional_mounts: &[HashMap<String, serde_json::Value>],
    timeout_secs: Option<u64>,
    env: &HashMap<String, String>,
    config: &Config,
) -> Result<ContainerOutput> {
    // Validate mounts
    let mounts = validate_group_mounts(group_folder, chat_jid, is_main, additional_mounts, config)?;

    // Build the docker command
    let args = build_docker_args(group_folder, &mounts, env, config);

    // Build input JSON
    let input = json!({
        "prompt": prompt,
        "sessionId": session_id,
        "groupFolder": group_folder,
        "chatJid": chat_jid,
        "isMain": is_main,
    });
    let input_bytes = serde_json::to_vec(&input)?;

    debug!(group_folder, args = ?args, "Launching container");

    let timeout = std::time::Duration::from_secs(timeout_secs.unwrap_or(config.container_timeout));

    // Spawn the process
    let mut child = Command::new("docker")
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| NanoGridBotError::Container(format!("Failed to spawn docker: {e}")))?;

    // Write input to stdin
    if let Some(mut stdin) = child.stdin.take() {
        use tokio::io::AsyncWriteExt;
        stdin.write_all(&input_bytes).await.map_err(|e| {
            NanoGridBotError::Container(format!("Failed to write to container stdin: {e}"))
        })?;
        drop(stdin);
    }

    // Wait with timeout
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            NanoGridBotError::Timeout(format!(
                "Container timed out after {}s for group {group_folder}",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| NanoGridBotError::Container(format!("Container process error: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        warn!(
            group_folder,
            exit_code = ?output.status.code(),
            stderr = %stderr,
            "Container exited with non-zero status"
        );
    }

    // Parse output between markers
    parse_container_output(&stdout, &stderr)
}

/// Structured stdin payload for a container invocation.
///
/// Mirrors the source's free-form input object; every field the scheduler
/// and message adapter need to pass through is enumerated explicitly.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "groupFolder")]
    pub group_folder: String,
    #[serde(rename = "chatJid")]
    pub chat_jid: String,
    #[serde(rename = "isMain")]
    pub is_main: bool,
    #[serde(rename = "isScheduledTask")]
    pub is_scheduled_task: bool,
    #[serde(rename = "assistantName", skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
}

/// Fires once right after the container process is spawned, with the OS pid
/// and the logical container name used for `docker` bookkeeping.
pub type OnProcessHook = Box<dyn FnMut(u32, &str) + Send>;

/// Fires once per framed output event read from the container's stdout.
pub type OnOutputHook =
    Box<dyn FnMut(ContainerEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Run an agent container, streaming output events as they arrive instead of
/// waiting for the whole process to exit before looking at anything it said.
///
/// `on_process` fires once at spawn; `on_output` fires for each framed event
/// found between `OUTPUT_START_MARKER`/`OUTPUT_END_MARKER` on stdout. The
/// final `ContainerOutput` is derived from the last event seen (or stderr, if
/// none was ever emitted).
#[allow(clippy::too_many_arguments)]
pub async fn run_container_streaming(
    input: &ContainerInput,
    additional_mounts: &[HashMap<String, serde_json::Value>],
    timeout_secs: Option<u64>,
    env: &HashMap<String, String>,
    config: &Config,
    db: &Database,
    mut on_process: OnProcessHook,
    mut on_output: OnOutputHook,
) -> Result<ContainerOutput> {
    let metrics = MetricsRepository::new(db);
    let channel = input.chat_jid.split(':').next().unwrap_or("unknown");
    let metric_id = metrics
        .record_container_start(&input.group_folder, channel)
        .await?;
    let start = Instant::now();

    let result = run_container_streaming_inner(
        input,
        additional_mounts,
        timeout_secs,
        env,
        config,
        &mut on_process,
        &mut on_output,
    )
    .await;

    let duration = start.elapsed().as_secs_f64();
    match &result {
        Ok(output) => {
            info!(
                group_folder = %input.group_folder,
                status = %output.status,
                duration_secs = duration,
                "Streaming container execution completed"
            );
            metrics
                .record_container_end(metric_id, &output.status, Some(duration), None, None, None)
                .await?;
        }
        Err(e) => {
            error!(group_folder = %input.group_folder, error = %e, "Streaming container execution failed");
            let status = if matches!(e, NanoGridBotError::Timeout(_)) {
                "timeout"
            } else {
                "error"
            };
            metrics
                .record_container_end(
                    metric_id,
                    status,
                    Some(duration),
                    None,
                    None,
                    Some(&e.to_string()),
                )
                .await?;
        }
    }

    result
}

async fn run_container_streaming_inner(
    input: &ContainerInput,
    additional_mounts: &[HashMap<String, serde_json::Value>],
    timeout_secs: Option<u64>,
    env: &HashMap<String, String>,
    config: &Config,
    on_process: &mut OnProcessHook,
    on_output: &mut OnOutputHook,
) -> Result<ContainerOutput> {
    let mounts = validate_group_mounts(
        &input.group_folder,
        &input.chat_jid,
        input.is_main,
        additional_mounts,
        config,
    )?;

    let container_name = format!("ngb-{}-{}", input.group_folder, uuid::Uuid::new_v4());
    let args = build_docker_args_named(&container_name, &mounts, env, config);
    let input_bytes = serde_json::to_vec(input)?;

    debug!(group_folder = %input.group_folder, container_name, "Launching streaming container");

    let timeout = std::time::Duration::from_secs(timeout_secs.unwrap_or(config.container_timeout));

    let mut child = Command::new("docker")
        .args(&args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| NanoGridBotError::Container(format!("Failed to spawn docker: {e}")))?;

    if let Some(pid) = child.id() {
        on_process(pid, &container_name);
    }

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&input_bytes).await.map_err(|e| {
            NanoGridBotError::Container(format!("Failed to write to container stdin: {e}"))
        })?;
        drop(stdin);
    }

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_task = child.stderr.take().map(|stderr| {
        let buf = stderr_buf.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut guard = buf.lock().await;
                guard.push_str(&line);
                guard.push('\n');
            }
        })
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| NanoGridBotError::Container("Container stdout not piped".to_string()))?;

    let read_events = async {
        let mut reader = BufReader::new(stdout).lines();
        let mut last_event: Option<ContainerEvent> = None;
        let mut in_block = false;
        let mut block = String::new();

        while let Ok(Some(line)) = reader.next_line().await {
            if line.contains(OUTPUT_START_MARKER) {
                in_block = true;
                block.clear();
                continue;
            }
            if line.contains(OUTPUT_END_MARKER) {
                in_block = false;
                match serde_json::from_str::<ContainerEvent>(block.trim()) {
                    Ok(event) => {
                        on_output(event.clone()).await;
                        last_event = Some(event);
                    }
                    Err(e) => warn!(error = %e, "Failed to parse framed container event"),
                }
                continue;
            }
            if in_block {
                block.push_str(&line);
                block.push('\n');
            }
        }
        last_event
    };

    let last_event = tokio::time::timeout(timeout, read_events)
        .await
        .map_err(|_| {
            NanoGridBotError::Timeout(format!(
                "Container timed out after {}s for group {}",
                timeout.as_secs(),
                input.group_folder
            ))
        })?;

    let status = tokio::time::timeout(timeout, child.wait())
        .await
        .map_err(|_| {
            NanoGridBotError::Timeout(format!(
                "Container exit wait timed out for group {}",
                input.group_folder
            ))
        })?
        .map_err(|e| NanoGridBotError::Container(format!("Container process error: {e}")))?;

    if let Some(task) = stderr_task {
        let _ = task.await;
    }
    let stderr = stderr_buf.lock().await.clone();

    if !status.success() {
        warn!(
            group_folder = %input.group_folder,
            exit_code = ?status.code(),
            stderr = %stderr,
            "Streaming container exited with non-zero status"
        );
    }

    match last_event {
        Some(event) => Ok(event.into()),
        None => parse_container_output("", &stderr),
    }
}

/// Build docker run arguments (without the "docker" binary itself).
pub fn build_docker_args(
    group_folder: &str,
    mounts: &[crate::mount_security::MountSpec],
    env: &HashMap<String, String>,
    config: &Config,
) -> Vec<String> {
    let container_name = format!("ngb-{}-{}", group_folder, uuid::Uuid::new_v4());
    build_docker_args_named(&container_name, mounts, env, config)
}

/// Same as [`build_docker_args`] but with a caller-chosen container name, so
/// streaming callers can report the name via `on_process` before the args
/// are even assembled a second time.
pub fn build_docker_args_named(
    container_name: &str,
    mounts: &[crate::mount_security::MountSpec],
    env: &HashMap<String, String>,
    config: &Config,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network=none".to_string(),
        "--memory=2g".to_string(),
        "--cpus=1.0".to_string(),
        "-i".to_string(), // allow stdin
    ];

    // Volume mounts
    for mount in mounts {
        args.push("-v".to_string());
        args.push(mount.to_docker_arg());
    }

    // Environment variables
    for (k, v) in env {
        args.push("-e".to_string());
        args.push(format!("{k}={v}"));
    }

    // Image
    args.push(config.container_image.clone());

    args
}

/// Parse the container stdout for marker-delimited JSON output.
pub fn parse_container_output(stdout: &str, stderr: &str) -> Result<ContainerOutput> {
    // Look for output between markers
    if let Some(start) = stdout.find(OUTPUT_START_MARKER) {
        let after_marker = &stdout[start + OUTPUT_START_MARKER.len()..];
        if let Some(end) = after_marker.find(OUTPUT_END_MARKER) {
            let json_str = after_marker[..end].trim();
            match serde_json::from_str::<ContainerOutput>(json_str) {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!(error = %e, "Failed to parse container JSON output");
                }
            }
        }
    }

    // Fallback: try parsing stdout as JSON directly
    if let Ok(output) = serde_json::from_str::<ContainerOutput>(stdout.trim()) {
        return Ok(output);
    }

    // If there's any stdout, treat it as the result
    let trimmed = stdout.trim();
    if !trimmed.is_empty() {
        return Ok(ContainerOutput {
            status: "success".to_string(),
            result: Some(trimmed.to_string()),
            error: None,
            new_session_id: None,
        });
    }

    // No useful output
    let error_msg = if stderr.trim().is_empty() {
        "Container produced no output".to_string()
    } else {
        stderr.trim().to_string()
    };

    Ok(ContainerOutput {
        status: "error".to_string(),
        result: None,
        error: Some(error_msg),
        new_session_id: None,
    })
}

/// Check if Docker is available on the system.
pub async fn check_docker_available() -> Result<bool> {
    match Command::new("docker")
        .arg("version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(status) => Ok(status.success()),
        Err(_) => Ok(false),
    }
}

/// Get the status of a named container.
pub async fn get_container_status(name: &str) -> Result<String> {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{.State.Status}}", name])
        .output()
        .await
        .map_err(|e| NanoGridBotError::Container(format!("Failed to inspect container: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Ok("not_found".to_string())
    }
}

/// Forcibly remove a container by name.
pub async fn cleanup_container(name: &str) -> Result<()> {
    let output = Command::new("docker")
        .args(["rm", "-f", name])
        .output()
        .await
        .map_err(|e| NanoGridBotError::Container(format!("Failed to cleanup container: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Ignore "no such container" errors
        if !stderr.contains("No such container") {
            warn!(name, stderr = %stderr, "Container cleanup warning");
        }
    }

    Ok(())
}
