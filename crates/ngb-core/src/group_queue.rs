//! Dual-lane per-group scheduler: the heart of the orchestrator.
//!
//! Every group has two independent execution lanes — `message` (driven by
//! inbound chat activity) and `task` (driven by the scheduler) — sharing one
//! global concurrency cap. Messages take priority over tasks when draining a
//! group; only the message lane retries on failure, with exponential
//! backoff. A single mutex guards all group and global queue state; the
//! container work itself (the boxed closures passed to `enqueue_message_check`
//! / `enqueue_task`) always runs with the lock released via a
//! `tokio::spawn`-after-drop pattern, so a slow container run never blocks
//! another group's queue decision.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ngb_config::Config;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::container_handle::{ContainerHandle, Lane};
use crate::ipc::{write_close_sentinel, write_input_envelope};

/// Maximum number of retry attempts for a failed message-lane run.
const MAX_RETRIES: u32 = 5;

/// Exponential backoff: `5 * 2^(n-1)` seconds, message-lane only.
fn retry_delay(retry_count: u32) -> u64 {
    5 * 2u64.pow(retry_count.saturating_sub(1))
}

/// A unit of container work: runs with the queue's lock released and
/// resolves to whether the run succeeded cleanly.
pub type WorkFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send>;

/// Snapshot of one group's queue state, returned by `get_status`.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub group_jid: String,
    pub group_folder: String,
    pub active_message: bool,
    pub active_task: bool,
    pub pending_messages: bool,
    pub pending_task_count: usize,
    pub retry_count: u32,
    pub is_busy: bool,
    pub message_container_name: Option<String>,
    pub task_container_name: Option<String>,
}

/// Per-group state shared by both lanes.
struct GroupState {
    group_folder: String,

    // Message lane
    active_message: bool,
    idle_waiting: bool,
    pending_messages: bool,
    retry_count: u32,
    message_handle: Option<ContainerHandle>,

    // Task lane
    active_task: bool,
    pending_tasks: VecDeque<(i64, WorkFn)>,
    pending_task_ids: std::collections::HashSet<i64>,
    task_handle: Option<ContainerHandle>,
}

impl GroupState {
    fn new(group_folder: &str) -> Self {
        Self {
            group_folder: group_folder.to_string(),
            active_message: false,
            idle_waiting: false,
            pending_messages: false,
            retry_count: 0,
            message_handle: None,
            active_task: false,
            pending_tasks: VecDeque::new(),
            pending_task_ids: std::collections::HashSet::new(),
            task_handle: None,
        }
    }
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    max_concurrent: usize,
    waiting_groups: VecDeque<String>,
    process_messages_fn: Option<ProcessMessagesFn>,
}

/// Callback the queue invokes to process a group's message lane. Takes the
/// group jid and returns whether the run succeeded.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// The dual-lane group queue. Cheaply cloneable; all instances share the
/// same underlying state.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
    data_dir: std::path::PathBuf,
    shutting_down: Arc<AtomicBool>,
    close_timers: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl GroupQueue {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                max_concurrent: config.container_max_concurrent,
                waiting_groups: VecDeque::new(),
                process_messages_fn: None,
            })),
            data_dir: config.data_dir.clone(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            close_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register the callback used to process a group's message lane.
    /// Must be called once during startup before any `enqueue_message_check`.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    /// Mark the queue as shutting down. New enqueue calls are rejected.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn ensure_group(inner: &mut Inner, group_jid: &str, group_folder: &str) {
        inner
            .groups
            .entry(group_jid.to_string())
            .or_insert_with(|| GroupState::new(group_folder));
    }

    /// Request a message-lane check for a group.
    ///
    /// Four-step decision per spec: reject if shutting down; if the lane is
    /// already active, just flag pending; if global capacity is exhausted,
    /// flag pending and queue the group for later draining (deduped); else
    /// claim the lane synchronously and spawn the run.
    pub async fn enqueue_message_check(&self, group_jid: &str, group_folder: &str) {
        if self.is_shutting_down() {
            warn!(group_jid, "Rejecting enqueue_message_check: shutting down");
            return;
        }

        let (should_run, process_fn) = {
            let mut inner = self.inner.lock().await;
            Self::ensure_group(&mut inner, group_jid, group_folder).await;
            let max_concurrent = inner.max_concurrent;
            let active_count = inner.active_count;
            let state = inner.groups.get_mut(group_jid).unwrap();

            if state.active_message {
                state.pending_messages = true;
                (false, None)
            } else if active_count >= max_concurrent {
                state.pending_messages = true;
                if !inner.waiting_groups.contains(&group_jid.to_string()) {
                    inner.waiting_groups.push_back(group_jid.to_string());
                }
                (false, None)
            } else {
                state.active_message = true;
                state.idle_waiting = false;
                state.pending_messages = false;
                inner.active_count += 1;
                (true, inner.process_messages_fn.clone())
            }
        };

        if should_run {
            self.run_message_lane(group_jid.to_string(), process_fn);
        }
    }

    fn run_message_lane(&self, group_jid: String, process_fn: Option<ProcessMessagesFn>) {
        let this = self.clone();
        tokio::spawn(async move {
            let Some(process_fn) = process_fn else {
                error!(%group_jid, "No process_messages_fn registered, dropping message run");
                this.complete_message(&group_jid, false).await;
                return;
            };
            let success = process_fn(group_jid.clone()).await;
            this.complete_message(&group_jid, success).await;
        });
    }

    /// Enqueue a scheduled task's closure for a group's task lane. Dedups by
    /// `task_id`. If the message lane is active and idle (waiting on new
    /// input with nothing left to do), signal it to close so the task lane
    /// can run without waiting for the container's own idle timeout.
    pub async fn enqueue_task(&self, group_jid: &str, group_folder: &str, task_id: i64, work: WorkFn) {
        if self.is_shutting_down() {
            warn!(group_jid, task_id, "Rejecting enqueue_task: shutting down");
            return;
        }

        let (should_run, preempt) = {
            let mut inner = self.inner.lock().await;
            Self::ensure_group(&mut inner, group_jid, group_folder).await;
            let max_concurrent = inner.max_concurrent;
            let active_count = inner.active_count;
            let state = inner.groups.get_mut(group_jid).unwrap();

            if state.pending_task_ids.contains(&task_id) {
                debug!(group_jid, task_id, "Task already queued, skipping duplicate");
                return;
            }
            state.pending_task_ids.insert(task_id);
            state.pending_tasks.push_back((task_id, work));

            if state.active_task {
                // Step 3 per spec: a task lane already running just gets
                // this task appended and returns before step 4's preemption
                // check is ever reached.
                (false, false)
            } else {
                // Step 4: the task lane needs a slot (whether or not one is
                // free right now), so preempt an idle message lane.
                let preempt = state.active_message && state.idle_waiting;
                if active_count >= max_concurrent {
                    if !inner.waiting_groups.contains(&group_jid.to_string()) {
                        inner.waiting_groups.push_back(group_jid.to_string());
                    }
                    (false, preempt)
                } else {
                    state.active_task = true;
                    inner.active_count += 1;
                    (true, preempt)
                }
            }
        };

        if preempt {
            self.close_stdin(group_jid).await;
        }

        if should_run {
            self.run_next_task(group_jid.to_string());
        }
    }

    fn run_next_task(&self, group_jid: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let work = {
                let mut inner = this.inner.lock().await;
                let state = match inner.groups.get_mut(&group_jid) {
                    Some(s) => s,
                    None => return,
                };
                match state.pending_tasks.pop_front() {
                    Some((task_id, work)) => {
                        state.pending_task_ids.remove(&task_id);
                        Some(work)
                    }
                    None => {
                        state.active_task = false;
                        inner.active_count = inner.active_count.saturating_sub(1);
                        None
                    }
                }
            };

            match work {
                Some(work) => {
                    let success = work().await;
                    if !success {
                        debug!(%group_jid, "Task run failed; scheduler owns retry via next_run");
                    }
                    this.complete_task(&group_jid).await;
                }
                None => {
                    this.drain_group(&group_jid).await;
                }
            }
        });
    }

    /// Register the handle of a message-lane container that just spawned.
    /// Called from the container runner's `on_process` hook, so there is a
    /// brief window after a lane is claimed (synchronously, at enqueue time)
    /// before the handle itself is known.
    pub async fn set_message_handle(&self, group_jid: &str, handle: ContainerHandle) {
        if let Some(state) = self.inner.lock().await.groups.get_mut(group_jid) {
            state.message_handle = Some(handle);
        }
    }

    /// Register the handle of a task-lane container that just spawned.
    pub async fn set_task_handle(&self, group_jid: &str, handle: ContainerHandle) {
        if let Some(state) = self.inner.lock().await.groups.get_mut(group_jid) {
            state.task_handle = Some(handle);
        }
    }

    /// Notify the queue that a group's message-lane container has gone
    /// idle (caught up, waiting on new input). If tasks are pending and the
    /// task lane is free, this preempts the message lane's stdin.
    pub async fn notify_idle(&self, group_jid: &str) {
        let should_preempt = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.groups.get_mut(group_jid) else {
                return;
            };
            state.idle_waiting = true;
            !state.pending_tasks.is_empty() && !state.active_task
        };

        if should_preempt {
            self.close_stdin(group_jid).await;
        }
    }

    /// No-op, kept for symmetry with `notify_idle` on the task lane. The
    /// task lane's completion is driven entirely by the scheduler's close
    /// timer rather than an idle signal.
    pub async fn notify_task_idle(&self, _group_jid: &str) {}

    /// Write an input envelope to the message lane's drop-dir, if that lane
    /// is currently active for this group. Returns whether the write was
    /// attempted (a known, active group folder).
    pub async fn send_message(&self, group_jid: &str, text: &str) -> bool {
        let group_folder = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.groups.get_mut(group_jid) else {
                return false;
            };
            if !state.active_message {
                return false;
            }
            state.idle_waiting = false;
            state.group_folder.clone()
        };

        if let Err(e) = write_input_envelope(&self.data_dir, &group_folder, text).await {
            debug!(group_jid, error = %e, "Failed to write IPC input envelope");
        }
        true
    }

    /// Write the `_close` sentinel for a group's message lane.
    pub async fn close_stdin(&self, group_jid: &str) {
        let group_folder = {
            let inner = self.inner.lock().await;
            inner.groups.get(group_jid).map(|s| s.group_folder.clone())
        };
        if let Some(folder) = group_folder {
            if let Err(e) = write_close_sentinel(&self.data_dir, &folder).await {
                debug!(group_jid, error = %e, "Failed to write close sentinel");
            }
        }
    }

    /// Write the `_close` sentinel for a group's task lane. Same drop-dir
    /// convention as the message lane — both lanes of a group share one
    /// IPC folder, distinguished by the container process reading it.
    pub async fn close_task_stdin(&self, group_jid: &str) {
        self.close_stdin(group_jid).await;
    }

    /// Arm a `delay`-second timer that calls `close_task_stdin` unless
    /// cancelled first (e.g. the task exits on its own before the timer
    /// fires). Replaces any existing timer for the group.
    pub async fn arm_close_timer(&self, group_jid: &str, delay: std::time::Duration) {
        let (tx, rx) = oneshot::channel();
        {
            let mut timers = self.close_timers.lock().await;
            if let Some(old) = timers.insert(group_jid.to_string(), tx) {
                let _ = old.send(());
            }
        }

        let this = self.clone();
        let group_jid = group_jid.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    this.close_task_stdin(&group_jid).await;
                }
                _ = rx => {}
            }
        });
    }

    /// Cancel a previously armed close timer, if any.
    pub async fn cancel_close_timer(&self, group_jid: &str) {
        if let Some(tx) = self.close_timers.lock().await.remove(group_jid) {
            let _ = tx.send(());
        }
    }

    /// Whether a group's message lane is considered busy: active and not
    /// idly waiting. The task lane is invisible to this check — a group can
    /// be "not busy" from the message lane's perspective while its task lane
    /// runs concurrently.
    pub async fn is_busy(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group_jid)
            .is_some_and(|s| s.active_message && !s.idle_waiting)
    }

    /// Snapshot of every known group's queue state, for `/status` and for
    /// `writeQueueStatusSnapshot`.
    pub async fn get_status(&self) -> Vec<GroupStatus> {
        let inner = self.inner.lock().await;
        inner
            .groups
            .iter()
            .map(|(jid, s)| GroupStatus {
                group_jid: jid.clone(),
                group_folder: s.group_folder.clone(),
                active_message: s.active_message,
                active_task: s.active_task,
                pending_messages: s.pending_messages,
                pending_task_count: s.pending_tasks.len(),
                retry_count: s.retry_count,
                is_busy: s.active_message && !s.idle_waiting,
                message_container_name: s.message_handle.as_ref().map(|h| h.container_name.clone()),
                task_container_name: s.task_handle.as_ref().map(|h| h.container_name.clone()),
            })
            .collect()
    }

    /// Completion path for a finished message-lane run: reset or bump the
    /// retry counter, schedule a detached backoff retry on failure (never
    /// blocking the queue's lock), then release the lane and drain.
    async fn complete_message(&self, group_jid: &str, success: bool) {
        let retry_after = {
            let mut inner = self.inner.lock().await;
            let Some(state) = inner.groups.get_mut(group_jid) else {
                return;
            };

            if success {
                state.retry_count = 0;
                None
            } else {
                state.retry_count += 1;
                if state.retry_count > MAX_RETRIES {
                    error!(
                        group_jid,
                        retries = state.retry_count,
                        "Message lane exceeded max retries, giving up"
                    );
                    state.retry_count = 0;
                    None
                } else {
                    Some(retry_delay(state.retry_count))
                }
            }
        };

        if let Some(delay_secs) = retry_after {
            warn!(group_jid, delay_secs, "Message lane failed, scheduling retry");
            let this = self.clone();
            let group_jid = group_jid.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                let folder = {
                    let inner = this.inner.lock().await;
                    inner.groups.get(&group_jid).map(|s| s.group_folder.clone())
                };
                if let Some(folder) = folder {
                    this.enqueue_message_check(&group_jid, &folder).await;
                }
            });
        }

        {
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.groups.get_mut(group_jid) {
                state.active_message = false;
                state.message_handle = None;
            }
            inner.active_count = inner.active_count.saturating_sub(1);
        }

        self.drain_group(group_jid).await;
    }

    async fn complete_task(&self, group_jid: &str) {
        {
            let mut inner = self.inner.lock().await;
            if let Some(state) = inner.groups.get_mut(group_jid) {
                state.active_task = false;
                state.task_handle = None;
            }
            inner.active_count = inner.active_count.saturating_sub(1);
        }
        self.drain_group(group_jid).await;
    }

    /// Try to promote one inactive-but-pending lane of a group into the
    /// active set. Claims the slot synchronously (mirrors the
    /// `enqueue_message_check`/`enqueue_task` accounting) but does not
    /// launch the run itself — the caller does that once the lock is
    /// released.
    async fn promote_one_lane(&self, group_jid: &str) -> Promote {
        let mut inner = self.inner.lock().await;
        let max_concurrent = inner.max_concurrent;
        let active_count = inner.active_count;
        let process_fn = inner.process_messages_fn.clone();
        let Some(state) = inner.groups.get_mut(group_jid) else {
            return Promote::None;
        };

        if state.pending_messages
            && !state.active_message
            && active_count < max_concurrent
            && process_fn.is_some()
        {
            state.active_message = true;
            state.idle_waiting = false;
            state.pending_messages = false;
            inner.active_count += 1;
            Promote::Message(process_fn.expect("checked above"))
        } else if !state.pending_tasks.is_empty() && !state.active_task && active_count < max_concurrent {
            state.active_task = true;
            inner.active_count += 1;
            Promote::Task
        } else {
            Promote::None
        }
    }

    /// Whether a group still has pending work on an inactive lane (used to
    /// decide if `drain_waiting` should give it another pass).
    async fn has_unclaimed_pending_work(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.groups.get(group_jid).is_some_and(|s| {
            (s.pending_messages && !s.active_message) || (!s.pending_tasks.is_empty() && !s.active_task)
        })
    }

    /// Drain a single group after one of its lanes frees a slot: messages
    /// before tasks, per spec. Falls through to `drain_waiting` once the
    /// group has no more pending work of either kind.
    async fn drain_group(&self, group_jid: &str) {
        match self.promote_one_lane(group_jid).await {
            Promote::Message(f) => self.run_message_lane(group_jid.to_string(), Some(f)),
            Promote::Task => self.run_next_task(group_jid.to_string()),
            Promote::None => self.drain_waiting().await,
        }
    }

    /// Promote waiting groups into the active set while capacity allows.
    /// Unlike `enqueue_message_check`, a waiting group may only have
    /// pending *task* work (queued via `enqueue_task` while at capacity),
    /// so each popped group is promoted on whichever lane is actually
    /// pending rather than assumed to be the message lane.
    async fn drain_waiting(&self) {
        loop {
            let group_jid = {
                let mut inner = self.inner.lock().await;
                if inner.active_count >= inner.max_concurrent {
                    None
                } else {
                    inner.waiting_groups.pop_front()
                }
            };
            let Some(group_jid) = group_jid else { break };

            let promoted = match self.promote_one_lane(&group_jid).await {
                Promote::Message(f) => {
                    self.run_message_lane(group_jid.clone(), Some(f));
                    true
                }
                Promote::Task => {
                    self.run_next_task(group_jid.clone());
                    true
                }
                Promote::None => false,
            };

            // A group can have both lanes pending; if one was just
            // promoted and the other is still waiting, give it another
            // turn in the queue rather than dropping it.
            if promoted && self.has_unclaimed_pending_work(&group_jid).await {
                self.inner.lock().await.waiting_groups.push_back(group_jid);
            }
        }
    }
}

enum Promote {
    Message(ProcessMessagesFn),
    Task,
    None,
}
