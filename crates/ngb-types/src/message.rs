use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::MessageRole;

/// Chat message model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub role: MessageRole,
}
