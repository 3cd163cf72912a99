//! Identifying information for a running container, tracked per group per
//! lane by `GroupQueue`.
//!
//! The container process itself is spawned and awaited entirely inside
//! `container_runner`, which owns the `tokio::process::Child` for the
//! duration of the run (it needs it to read stdout/stderr and `wait()`).
//! What `GroupQueue` needs is just enough to satisfy the "a handle exists
//! while the lane is active" invariant and to name the container in
//! shutdown logs — the pid and the `docker --name` value, reported via
//! `run_container_streaming`'s `on_process` hook as soon as the process
//! spawns.

/// Which of a group's two concurrent execution lanes a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Message,
    Task,
}

/// A running container attached to one group's message or task lane.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub group_jid: String,
    pub lane: Lane,
    pub group_folder: String,
    pub container_name: String,
    pub pid: u32,
}

impl ContainerHandle {
    pub fn new(
        group_jid: impl Into<String>,
        lane: Lane,
        group_folder: impl Into<String>,
        container_name: impl Into<String>,
        pid: u32,
    ) -> Self {
        Self {
            group_jid: group_jid.into(),
            lane,
            group_folder: group_folder.into(),
            container_name: container_name.into(),
            pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_handle_carries_fields() {
        let handle = ContainerHandle::new("group@jid", Lane::Message, "folder-a", "ngb-1", 4242);
        assert_eq!(handle.group_jid, "group@jid");
        assert_eq!(handle.lane, Lane::Message);
        assert_eq!(handle.group_folder, "folder-a");
        assert_eq!(handle.container_name, "ngb-1");
        assert_eq!(handle.pid, 4242);
    }

    #[test]
    fn lane_equality() {
        assert_eq!(Lane::Message, Lane::Message);
        assert_ne!(Lane::Message, Lane::Task);
    }
}
