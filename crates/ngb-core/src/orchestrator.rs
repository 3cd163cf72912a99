use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ngb_config::Config;
use ngb_db::{
    BindingRepository, Database, GroupRepository, MessageRepository, TokenRepository,
    WorkspaceRepository,
};
use ngb_types::{Message, NanoGridBotError, RegisteredGroup, Result, Workspace};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::group_queue::{GroupQueue, ProcessMessagesFn};
use crate::ipc_handler::{ChannelSender, IpcHandler};
use crate::message_adapter::process_group_messages;
use crate::router::{MessageRouter, RouteAction};
use crate::task_scheduler::TaskScheduler;

/// System health status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub channels_connected: usize,
    pub channels_total: usize,
    pub registered_groups: usize,
    pub active_containers: usize,
    pub pending_tasks: usize,
    pub uptime_seconds: f64,
}

/// Main orchestrator that ties all subsystems together.
///
/// Responsible for:
/// - Loading workspaces from DB
/// - Starting/stopping subsystems (scheduler, IPC handler, group queue)
/// - Running the message polling loop
/// - Handling token binding and guidance messages
/// - Providing health status
pub struct Orchestrator {
    config: Config,
    db: Arc<Database>,
    channels: Arc<Vec<Box<dyn ChannelSender>>>,
    queue: Arc<GroupQueue>,
    scheduler: Mutex<TaskScheduler>,
    ipc_handler: Mutex<IpcHandler>,
    router: MessageRouter,
    workspaces: Mutex<HashMap<String, Workspace>>,
    /// Per-group message watermark: the timestamp of the last message this
    /// group's lane was told about. There is no dedicated persistence for
    /// this column, so it lives in memory and defaults to the epoch on
    /// first contact with a group (i.e. "everything is new").
    watermarks: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
    start_time: Mutex<Option<Instant>>,
    healthy: Mutex<bool>,
    shutdown: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl Orchestrator {
    /// Create a new orchestrator instance.
    pub fn new(config: Config, db: Arc<Database>, channels: Vec<Box<dyn ChannelSender>>) -> Self {
        let channels = Arc::new(channels);
        let queue = Arc::new(GroupQueue::new(&config));
        let scheduler = TaskScheduler::new(
            db.clone(),
            queue.clone(),
            config.clone(),
            channels.clone(),
        );
        let ipc_handler = IpcHandler::new(channels.clone(), &config);
        let router = MessageRouter::new(config.clone(), db.clone(), channels.clone());
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            db,
            channels,
            queue,
            scheduler: Mutex::new(scheduler),
            ipc_handler: Mutex::new(ipc_handler),
            router,
            workspaces: Mutex::new(HashMap::new()),
            watermarks: Arc::new(Mutex::new(HashMap::new())),
            last_timestamp: Mutex::new(None),
            start_time: Mutex::new(None),
            healthy: Mutex::new(false),
            shutdown: shutdown_tx,
            shutdown_rx,
        }
    }

    /// Build the closure the group queue calls to run a group's message
    /// lane, binding it to this orchestrator's db/config/channels/watermark
    /// state, and install it on the queue.
    async fn install_process_messages_fn(&self) {
        let db = self.db.clone();
        let config = self.config.clone();
        let channels = self.channels.clone();
        let queue = self.queue.clone();
        let watermarks = self.watermarks.clone();
        let assistant_name = self.config.assistant_name.clone();

        let process_fn: ProcessMessagesFn = Arc::new(move |group_jid: String| {
            let db = db.clone();
            let config = config.clone();
            let channels = channels.clone();
            let queue = queue.clone();
            let watermarks = watermarks.clone();
            let assistant_name = assistant_name.clone();
            Box::pin(async move {
                let group_repo = GroupRepository::new(&db);
                let group = match group_repo.get_group(&group_jid).await {
                    Ok(Some(g)) => g,
                    Ok(None) => {
                        warn!(group_jid, "Message lane fired for unregistered group");
                        return false;
                    }
                    Err(e) => {
                        error!(group_jid, error = %e, "Failed to look up registered group");
                        return false;
                    }
                };

                let watermark = {
                    let map = watermarks.lock().await;
                    map.get(&group_jid)
                        .copied()
                        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
                };

                let success = process_group_messages(
                    &group,
                    watermark,
                    &assistant_name,
                    &config,
                    &db,
                    &channels,
                    &queue,
                )
                .await;

                if success {
                    watermarks.lock().await.insert(group_jid, Utc::now());
                }
                success
            })
        });

        self.queue.set_process_messages_fn(process_fn).await;
    }

    /// Start the orchestrator and all subsystems.
    ///
    /// Flow: load workspaces from DB → install the message-lane callback →
    /// start scheduler → start IPC handler → set healthy → begin message
    /// loop.
    pub async fn start(&self) -> Result<()> {
        info!("Starting orchestrator");

        // Load workspaces from DB
        let ws_repo = WorkspaceRepository::new(&self.db);
        let all_ws = ws_repo.get_all().await?;
        {
            let mut ws_map = self.workspaces.lock().await;
            for ws in &all_ws {
                ws_map.insert(ws.id.clone(), ws.clone());
            }
        }
        info!(count = all_ws.len(), "Loaded workspaces");

        // Load bindings to get JIDs for IPC handler
        let binding_repo = BindingRepository::new(&self.db);
        let mut jids = Vec::new();
        for ws in &all_ws {
            let bindings = binding_repo.get_by_workspace(&ws.id).await?;
            for b in bindings {
                jids.push(b.channel_jid);
            }
        }

        self.install_process_messages_fn().await;

        // Start subsystems
        {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.start();
        }
        {
            let mut ipc = self.ipc_handler.lock().await;
            ipc.start(&jids);
        }

        // Mark healthy
        *self.healthy.lock().await = true;
        *self.start_time.lock().await = Some(Instant::now());

        info!("Orchestrator started successfully");
        Ok(())
    }

    /// Run the message polling loop.
    pub async fn run_message_loop(&self) -> Result<()> {
        let poll_ms = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(poll_ms, "Message loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                    if let Err(e) = self.poll_messages().await {
                        error!(error = %e, "Message poll failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, exiting message loop");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Poll for new messages and route them.
    async fn poll_messages(&self) -> Result<()> {
        let since = { *self.last_timestamp.lock().await };
        let msg_repo = MessageRepository::new(&self.db, self.config.message_cache_size);
        let messages = msg_repo.get_new_messages(since).await?;

        if messages.is_empty() {
            return Ok(());
        }

        debug!(count = messages.len(), "Polled new messages");

        // Group messages by chat JID
        let mut by_jid: HashMap<String, Vec<&Message>> = HashMap::new();
        for msg in &messages {
            by_jid.entry(msg.chat_jid.clone()).or_default().push(msg);
        }

        // Update last_timestamp to the most recent message
        if let Some(latest) = messages.iter().map(|m| m.timestamp).max() {
            *self.last_timestamp.lock().await = Some(latest);
        }

        // Route each channel's messages
        for jid_messages in by_jid.values() {
            if let Some(last_msg) = jid_messages.last() {
                let route_result = self.router.route_message(last_msg).await?;
                match route_result.action {
                    RouteAction::Process => {
                        if let (Some(folder), Some(_ws_id)) =
                            (route_result.workspace_folder, route_result.workspace_id)
                        {
                            self.queue
                                .enqueue_message_check(&last_msg.chat_jid, &folder)
                                .await;
                        }
                    }
                    RouteAction::BindToken { token } => {
                        let token_repo = TokenRepository::new(&self.db);
                        match token_repo.validate_and_consume(&token).await? {
                            Some(workspace_id) => {
                                let binding_repo = BindingRepository::new(&self.db);
                                binding_repo
                                    .bind(&last_msg.chat_jid, &workspace_id)
                                    .await?;

                                // Reload workspace into cache
                                let ws_repo = WorkspaceRepository::new(&self.db);
                                if let Some(ws) = ws_repo.get(&workspace_id).await? {
                                    let ws_name = ws.name.clone();

                                    // A bound chat is, for the purposes of
                                    // the group queue and task scheduler, a
                                    // registered group: same folder, keyed
                                    // by the chat jid it was just bound to.
                                    let group_repo = GroupRepository::new(&self.db);
                                    let group = RegisteredGroup {
                                        jid: last_msg.chat_jid.clone(),
                                        name: ws_name.clone(),
                                        folder: ws.folder.clone(),
                                        trigger_pattern: None,
                                        container_config: ws.container_config.clone(),
                                        requires_trigger: false,
                                    };
                                    if let Err(e) = group_repo.save_group(&group).await {
                                        warn!(error = %e, "Failed to register group for bound chat");
                                    }

                                    self.workspaces
                                        .lock()
                                        .await
                                        .insert(workspace_id, ws);

                                    if let Err(e) = self.router.send_response(
                                        &last_msg.chat_jid,
                                        &format!(
                                            "Bound to workspace \"{}\". You can now send messages to interact with the agent.",
                                            ws_name
                                        ),
                                    ).await {
                                        warn!(error = %e, "Failed to send bind success response");
                                    }
                                }
                            }
                            None => {
                                if let Err(e) = self.router.send_response(
                                    &last_msg.chat_jid,
                                    "Invalid or expired token. Run `ngb workspace create <name>` to get a new token.",
                                ).await {
                                    warn!(error = %e, "Failed to send bind failure response");
                                }
                            }
                        }
                    }
                    RouteAction::Unbound => {
                        if let Err(e) = self.router.send_response(
                            &last_msg.chat_jid,
                            "Welcome to NanoGridBot!\nThis chat is not bound to a workspace.\nRun `ngb workspace create <name>` in CLI, then send the generated token here to bind.",
                        ).await {
                            warn!(error = %e, "Failed to send guidance response");
                        }
                    }
                    RouteAction::BuiltinCommand { ref command } => {
                        self.handle_builtin_command(&last_msg.chat_jid, command)
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle built-in commands.
    async fn handle_builtin_command(&self, jid: &str, command: &str) {
        let response = match command {
            "/status" => {
                let health = self.get_health_status().await;
                format!(
                    "Status: {}\nWorkspaces: {}\nActive containers: {}\nUptime: {:.0}s",
                    if health.healthy { "healthy" } else { "unhealthy" },
                    health.registered_groups,
                    health.active_containers,
                    health.uptime_seconds,
                )
            }
            "/help" => {
                "Commands:\n/status - Show system status\n/help - Show this help\n/unbind - Unbind this chat from its workspace".to_string()
            }
            "/unbind" => {
                let binding_repo = BindingRepository::new(&self.db);
                match binding_repo.unbind(jid).await {
                    Ok(true) => "Chat unbound from workspace.".to_string(),
                    Ok(false) => "This chat is not bound to any workspace.".to_string(),
                    Err(e) => format!("Error: {e}"),
                }
            }
            _ => format!("Unknown command: {command}"),
        };

        if let Err(e) = self.router.send_response(jid, &response).await {
            warn!(error = %e, command, "Failed to send command response");
        }
    }

    /// Stop the orchestrator and all subsystems.
    ///
    /// Begins queue shutdown first (so no new lane work is accepted), then
    /// logs any containers still running as detached before tearing down
    /// the scheduler and IPC handler.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping orchestrator");

        self.queue.begin_shutdown();
        {
            let scheduler = self.scheduler.lock().await;
            scheduler.begin_shutdown();
        }
        let _ = self.shutdown.send(true);

        for status in self.queue.get_status().await {
            if status.active_message {
                warn!(
                    group_jid = %status.group_jid,
                    group_folder = %status.group_folder,
                    container_name = status.message_container_name.as_deref().unwrap_or("unknown"),
                    "Container detached at shutdown"
                );
            }
            if status.active_task {
                warn!(
                    group_jid = %status.group_jid,
                    group_folder = %status.group_folder,
                    container_name = status.task_container_name.as_deref().unwrap_or("unknown"),
                    "Container detached at shutdown"
                );
            }
        }

        {
            let mut scheduler = self.scheduler.lock().await;
            scheduler.stop();
        }
        {
            let mut ipc = self.ipc_handler.lock().await;
            ipc.stop();
        }

        *self.healthy.lock().await = false;
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Register a workspace.
    pub async fn register_workspace(&self, ws: Workspace) -> Result<()> {
        let ws_repo = WorkspaceRepository::new(&self.db);
        ws_repo.save(&ws).await?;

        let id = ws.id.clone();
        self.workspaces.lock().await.insert(id.clone(), ws);

        info!(workspace_id = %id, "Workspace registered");
        Ok(())
    }

    /// Unregister a workspace.
    pub async fn unregister_workspace(&self, workspace_id: &str) -> Result<bool> {
        let ws_repo = WorkspaceRepository::new(&self.db);
        let deleted = ws_repo.delete(workspace_id).await?;

        if deleted {
            self.workspaces.lock().await.remove(workspace_id);
            info!(workspace_id, "Workspace unregistered");
        }

        Ok(deleted)
    }

    /// Send a prompt directly to a workspace's container.
    pub async fn send_to_workspace(
        &self,
        workspace_folder: &str,
        _prompt: &str,
        _session_id: &str,
    ) -> Result<()> {
        let ws_map = self.workspaces.lock().await;
        let ws = ws_map
            .values()
            .find(|w| w.folder == workspace_folder)
            .ok_or_else(|| {
                NanoGridBotError::Other(format!("Workspace not found: {workspace_folder}"))
            })?;

        let ws_id = ws.id.clone();
        drop(ws_map);

        // Find a bound JID for this workspace (use workspace_id as fallback)
        let binding_repo = BindingRepository::new(&self.db);
        let bindings = binding_repo.get_by_workspace(&ws_id).await?;
        let jid = bindings
            .first()
            .map(|b| b.channel_jid.clone())
            .unwrap_or_else(|| format!("cli:{workspace_folder}"));

        self.queue.enqueue_message_check(&jid, workspace_folder).await;
        Ok(())
    }

    /// Get the current health status.
    pub async fn get_health_status(&self) -> HealthStatus {
        let healthy = *self.healthy.lock().await;
        let ws_count = self.workspaces.lock().await.len();
        let status = self.queue.get_status().await;
        let active_containers = status
            .iter()
            .filter(|s| s.active_message || s.active_task)
            .count();
        let pending_tasks = status.iter().map(|s| s.pending_task_count).sum();
        let uptime = self
            .start_time
            .lock()
            .await
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        HealthStatus {
            healthy,
            channels_connected: self.channels.len(),
            channels_total: self.channels.len(),
            registered_groups: ws_count,
            active_containers,
            pending_tasks,
            uptime_seconds: uptime,
        }
    }

    /// Get a reference to the group queue.
    pub fn queue(&self) -> &Arc<GroupQueue> {
        &self.queue
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Get a reference to the router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ngb_db::WorkspaceRepository;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockChannel {
        prefix: String,
        send_count: Arc<AtomicU32>,
    }

    impl MockChannel {
        fn new(prefix: &str) -> Self {
            Self {
                prefix: prefix.to_string(),
                send_count: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl ChannelSender for MockChannel {
        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with(&self.prefix)
        }

        fn send_message(
            &self,
            _jid: &str,
            _text: &str,
            _reply_to: Option<&str>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.send_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn test_config() -> Config {
        let base = std::path::PathBuf::from("/tmp/ngb-orch-test");
        Config {
            project_name: "test".to_string(),
            version: "0.0.1".to_string(),
            debug: false,
            base_dir: base.clone(),
            data_dir: base.join("data"),
            store_dir: base.join("store"),
            groups_dir: base.join("groups"),
            workspaces_dir: base.join("workspaces"),
            db_path: base.join("store/messages.db"),
            whatsapp_session_path: base.join("store/whatsapp_session"),
            openai_api_key: None,
            anthropic_api_key: None,
            telegram_bot_token: None,
            slack_bot_token: None,
            slack_signing_secret: None,
            discord_bot_token: None,
            qq_host: "127.0.0.1".to_string(),
            qq_port: 20000,
            feishu_app_id: None,
            feishu_app_secret: None,
            wecom_corp_id: None,
            wecom_agent_id: None,
            wecom_secret: None,
            dingtalk_app_key: None,
            dingtalk_app_secret: None,
            claude_api_url: "https://api.anthropic.com".to_string(),
            claude_api_version: "2023-06-01".to_string(),
            claude_model: "claude-sonnet-4-20250514".to_string(),
            claude_max_tokens: 4096,
            cli_default_group: "cli".to_string(),
            container_timeout: 300,
            container_max_output_size: 100_000,
            container_max_concurrent: 5,
            container_image: "nanogridbot-agent:latest".to_string(),
            assistant_name: "Andy".to_string(),
            trigger_pattern: None,
            poll_interval: 2000,
            max_messages_per_minute: 10,
            message_cache_size: 1000,
            batch_size: 100,
            db_connection_pool_size: 5,
            ipc_file_buffer_size: 8192,
            log_level: "INFO".to_string(),
            log_format: "default".to_string(),
            log_rotation: "10 MB".to_string(),
            log_retention: "7 days".to_string(),
            web_host: "0.0.0.0".to_string(),
            web_port: 8080,
            scheduler_poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
            main_group_folder: "main".to_string(),
        }
    }

    fn make_workspace(id: &str, name: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            name: name.to_string(),
            owner: "test".to_string(),
            folder: name.to_string(),
            shared: false,
            container_config: None,
        }
    }

    #[tokio::test]
    async fn orchestrator_new() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let tg = MockChannel::new("telegram:");
        let channels: Vec<Box<dyn ChannelSender>> = vec![Box::new(tg)];
        let orch = Orchestrator::new(test_config(), db, channels);

        let health = orch.get_health_status().await;
        assert!(!health.healthy);
        assert_eq!(health.channels_total, 1);
        assert_eq!(health.registered_groups, 0);
    }

    #[tokio::test]
    async fn orchestrator_start_stop() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        orch.start().await.unwrap();
        let health = orch.get_health_status().await;
        assert!(health.healthy);
        assert!(health.uptime_seconds >= 0.0);

        orch.stop().await.unwrap();
        let health = orch.get_health_status().await;
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn register_and_unregister_workspace() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        let ws = make_workspace("ws-1", "test-agent");
        orch.register_workspace(ws).await.unwrap();
        assert_eq!(orch.get_health_status().await.registered_groups, 1);

        let deleted = orch.unregister_workspace("ws-1").await.unwrap();
        assert!(deleted);
        assert_eq!(orch.get_health_status().await.registered_groups, 0);
    }

    #[tokio::test]
    async fn unregister_nonexistent_workspace() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        let deleted = orch.unregister_workspace("nonexistent").await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn health_status_reflects_workspaces() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let ws_repo = WorkspaceRepository::new(&db);
        ws_repo.save(&make_workspace("ws-1", "agent1")).await.unwrap();
        ws_repo.save(&make_workspace("ws-2", "agent2")).await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);
        orch.start().await.unwrap();

        let health = orch.get_health_status().await;
        assert_eq!(health.registered_groups, 2);
        assert!(health.healthy);

        orch.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_to_workspace_unknown() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        let result = orch.send_to_workspace("nonexistent", "hello", "s1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_to_registered_workspace() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        orch.register_workspace(make_workspace("ws-1", "test_folder"))
            .await
            .unwrap();

        let result = orch.send_to_workspace("test_folder", "hello", "s1").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn health_status_serialization() {
        let health = HealthStatus {
            healthy: true,
            channels_connected: 3,
            channels_total: 5,
            registered_groups: 10,
            active_containers: 2,
            pending_tasks: 5,
            uptime_seconds: 3600.5,
        };

        let json = serde_json::to_string(&health).unwrap();
        let back: HealthStatus = serde_json::from_str(&json).unwrap();
        assert!(back.healthy);
        assert_eq!(back.channels_connected, 3);
        assert_eq!(back.registered_groups, 10);
    }

    #[tokio::test]
    async fn poll_messages_empty() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.initialize().await.unwrap();

        let channels: Vec<Box<dyn ChannelSender>> = vec![];
        let orch = Orchestrator::new(test_config(), db, channels);

        let result = orch.poll_messages().await;
        assert!(result.is_ok());
    }
}
