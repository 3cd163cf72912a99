use serde::{Deserialize, Serialize};

/// ChannelBinding — maps an IM chat to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel_jid: String,
    pub workspace_id: String,
}

/// AccessToken — used by IM users to bind a chat to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub workspace_id: String,
    #[serde(default)]
    pub used: bool,
}
