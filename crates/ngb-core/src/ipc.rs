//! IPC drop-dir: the filesystem contract for delivering input lines and the
//! close sentinel to a running container.
//!
//! Each active container has a directory `<dataDir>/ipc/<groupFolder>/input/`.
//! Writes are atomic (tmp file + rename) so the container never observes a
//! half-written envelope; the pattern is the same one `ipc_handler.rs` uses
//! for channel output polling, applied here to the input side only.

use std::path::{Path, PathBuf};

use serde_json::json;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use ngb_types::Result;

/// Name of the sentinel file that tells a container to drain and exit.
pub const CLOSE_SENTINEL_NAME: &str = "_close";

/// The `<dataDir>/ipc/<groupFolder>/input/` directory for a group.
pub fn input_dir(data_dir: &Path, group_folder: &str) -> PathBuf {
    data_dir.join("ipc").join(group_folder).join("input")
}

/// Write an input envelope: `<epochMs>-<rand4>.json` containing
/// `{"type":"message","text":<string>}`. Atomic via tmp-then-rename.
///
/// Failure to write is logged and swallowed by the caller (see
/// `group_queue::GroupQueue::send_message`) — the container will either
/// pick up the next message or time out, per spec's IPC error policy.
pub async fn write_input_envelope(data_dir: &Path, group_folder: &str, text: &str) -> Result<()> {
    let dir = input_dir(data_dir, group_folder);
    fs::create_dir_all(&dir).await?;

    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let rand4: String = Uuid::new_v4().simple().to_string()[..4].to_string();
    let filename = format!("{epoch_ms}-{rand4}.json");
    let final_path = dir.join(&filename);
    let tmp_path = dir.join(format!(".tmp-{filename}"));

    let body = json!({ "type": "message", "text": text });
    fs::write(&tmp_path, serde_json::to_vec(&body)?).await?;
    fs::rename(&tmp_path, &final_path).await?;

    debug!(group_folder, filename, "Wrote IPC input envelope");
    Ok(())
}

/// Write the `_close` sentinel into a group's input drop-dir. Contents are
/// irrelevant; the container treats the file's mere presence as "drain and
/// exit".
pub async fn write_close_sentinel(data_dir: &Path, group_folder: &str) -> Result<()> {
    let dir = input_dir(data_dir, group_folder);
    fs::create_dir_all(&dir).await?;
    fs::write(dir.join(CLOSE_SENTINEL_NAME), b"").await?;
    debug!(group_folder, "Wrote IPC close sentinel");
    Ok(())
}

/// Clear any stale `reply_context.json` left over from an earlier
/// interactive conversation, so a task run does not reply-to a user message.
pub async fn clear_reply_context(data_dir: &Path, group_folder: &str) -> Result<()> {
    let path = data_dir
        .join("ipc")
        .join(group_folder)
        .join("reply_context.json");
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
