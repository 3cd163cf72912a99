use std::path::PathBuf;

use ngb_config::Config;
use ngb_types::{NanoGridBotError, Result};
use serde::{Deserialize, Serialize};

use crate::security::check_path_traversal;

/// Mount permission mode for Docker volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    /// Docker volume suffix string.
    pub fn as_docker_flag(&self) -> &str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

/// A validated Docker bind-mount specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl MountSpec {
    /// Format as Docker `-v` argument value: `host:container:mode`.
    pub fn to_docker_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_docker_flag()
        )
    }
}

/// Return the set of host paths allowed as mount sources.
pub fn get_allowed_mount_paths(config: &Config) -> Vec<PathBuf> {
    vec![
        config.groups_dir.clone(),
        config.data_dir.clone(),
        config.store_dir.clone(),
        config.base_dir.clone(),
    ]
}

/// Build and validate the mount list for a container run.
///
/// Standard mounts:
/// - `{groups_dir}/{group_folder}` → `/workspace/group` (rw)
/// - `{data_dir}/global`           → `/workspace/global` (ro)
/// - `{data_dir}/sessions`         → `/workspace/sessions` (rw)
/// - `{data_dir}/ipc/{chat_jid}`   → `/workspace/ipc` (rw)
/// - If `is_main`: `{base_dir}`    → `/workspace/project` (ro)
///
/// Additional mounts come from `ContainerConfig::additional_mounts`.
pub fn validate_group_mounts(
    group_folder: &str,
    chat_jid: &str,
    is_main: bool,
    additional_mounts: &[std::collections::HashMap<String, serde_json::Value>],
    config: &Config,
) -> Result<Vec<MountSpec>> {
    let allowed = get_allowed_mount_paths(config);
    let mut mounts = Vec::new();

    // Group folder — read/write
    let group_host = config.groups_dir.join(group_folder);
    mounts.push(MountSpec {
        host_path: group_host,
        container_path: "/workspace/group".to_string(),
        mode: MountMode::ReadWrite,
    });

    // Global data — read-only
    let global_host = config.data_dir.join("global");
    mounts.push(MountSpec {
        host_path: global_host,
        container_path: "/workspace/global".to_string(),
        mode: MountMode::ReadOnly,
    });

    // Sessions — read/write
    let sessions_host = config.data_dir.join("sessions");
    mounts.push(MountSpec {
        host_path: sessions_host,
        container_path: "/workspace/sessions".to_string(),
        mode: MountMode::ReadWrite,
    });

    // IPC directory — read/write
    let ipc_host = config.data_dir.join("ipc").join(chat_jid);
    mounts.push(MountSpec {
        host_path: ipc_host,
        container_path: "/workspace/ipc".to_string(),
        mode: MountMode::ReadWrite,
    });

    // Project root for main container — read-only
    if is_main {
        mounts.push(MountSpec {
            host_path: config.base_dir.clone(),
            container_path: "/workspace/project".to_string(),
            mode: MountMode::ReadOnly,
        });
    }

    // Merge additional mounts from ContainerConfig
    for mount_map in additional_mounts {
        let host = mount_map
            .get("host_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let container = mount_map
            .get("container_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let mode_str = mount_map
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or("ro");

        if host.is_empty() || container.is_empty() {
            continue;
        }

        // Security: reject path traversal
        if check_path_traversal(host) || check_path_traversal(container) {
            return Err(NanoGridBotError::Security(format!(
                "Path traversal detected in mount: {host} -> {container}"
            )));
        }

        let host_path = PathBuf::from(host);

        // Security: host path must be under an allowed prefix
        let is_allowed = allowed.iter().any(|a| host_path.starts_with(a));
        if !is_allowed {
            return Err(NanoGridBotError::Security(format!(
                "Mount host path not in allowed list: {host}"
            )));
        }

        let mode = if mode_str == "rw" {
            MountMode::ReadWrite
        } else {
            MountMode::ReadOnly
        };

        mounts.push(MountSpec {
            host_path,
            container_path: container.to_string(),
            mode,
        });
    }

    Ok(mounts)
}
