use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Container execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub max_output_size: Option<i64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Container execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOutput {
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub new_session_id: Option<String>,
}

impl ContainerOutput {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// One framed event emitted by a running container, streamed over stdout as
/// it happens rather than collected after the process exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ContainerEvent {
    Success {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        new_session_id: Option<String>,
    },
    Error {
        #[serde(rename = "error")]
        message: String,
    },
}

impl ContainerEvent {
    /// The textual result carried by this event, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { result, .. } => result.as_deref(),
            Self::Error { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl From<ContainerEvent> for ContainerOutput {
    fn from(event: ContainerEvent) -> Self {
        match event {
            ContainerEvent::Success {
                result,
                new_session_id,
            } => ContainerOutput {
                status: "success".to_string(),
                result,
                error: None,
                new_session_id,
            },
            ContainerEvent::Error { message } => ContainerOutput {
                status: "error".to_string(),
                result: None,
                error: Some(message),
                new_session_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_config_serde_roundtrip() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());

        let config = ContainerConfig {
            additional_mounts: vec![],
            timeout: Some(300),
            max_output_size: Some(100_000),
            env,
        };

        let json = serde_json::to_string(&config).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Some(300));
        assert_eq!(back.env.get("API_KEY").unwrap(), "secret");
    }

    #[test]
    fn container_config_defaults() {
        let json = "{}";
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert!(config.additional_mounts.is_empty());
        assert!(config.timeout.is_none());
        assert!(config.env.is_empty());
    }

    #[test]
    fn container_event_success_into_output() {
        let event = ContainerEvent::Success {
            result: Some("hi".to_string()),
            new_session_id: None,
        };
        assert!(event.is_success());
        assert_eq!(event.text(), Some("hi"));
        let output: ContainerOutput = event.into();
        assert!(output.is_success());
    }

    #[test]
    fn container_event_error_deserializes() {
        let json = r#"{"status":"error","error":"boom"}"#;
        let event: ContainerEvent = serde_json::from_str(json).unwrap();
        match event {
            ContainerEvent::Error { message } => assert_eq!(message, "boom"),
            _ => panic!("expected error event"),
        }
    }

    #[test]
    fn container_output_serde_roundtrip() {
        let output = ContainerOutput {
            status: "success".to_string(),
            result: Some("Done".to_string()),
            error: None,
            new_session_id: Some("sess-123".to_string()),
        };

        let json = serde_json::to_string(&output).unwrap();
        let back: ContainerOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, "success");
        assert_eq!(back.result, Some("Done".to_string()));
        assert!(back.error.is_none());
    }
}
