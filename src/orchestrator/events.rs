//! Wire types for the real-time push channel.
//!
//! Every frame is a JSON envelope `{type, data?, timestamp, requestId?}`.
//! Outbound messages are an adjacently tagged enum flattened into the
//! envelope, so `type` and `data` come straight from the variant.
//!
//! `gitStatus` and the `project:<id>:git` channel are not produced by the
//! core; an external git watcher publishes them through
//! [`EventHub::publish_to`](super::hub::EventHub::publish_to).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{JobState, ProcessKind, ProjectId, ProjectStatus};
use crate::errors::OrchestratorError;

/// Channel names observers subscribe to.
pub mod channels {
    pub fn project_logs(project_id: &str) -> String {
        format!("project:{}:logs", project_id)
    }

    pub fn project_build(project_id: &str) -> String {
        format!("project:{}:build", project_id)
    }

    pub fn project_deploy(project_id: &str) -> String {
        format!("project:{}:deploy", project_id)
    }

    pub fn project_git(project_id: &str) -> String {
        format!("project:{}:git", project_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HubMessage {
    Welcome {
        connection_id: String,
        server_time: DateTime<Utc>,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
    Info {
        connection_id: String,
        subscriptions: Vec<String>,
        observers: usize,
        connected_at: DateTime<Utc>,
    },
    ProjectLog {
        project_id: ProjectId,
        kind: ProcessKind,
        stream: LogStream,
        line: String,
    },
    ProjectStatus {
        project_id: ProjectId,
        status: ProjectStatus,
        port: Option<u16>,
        error: Option<String>,
    },
    BuildProgress {
        project_id: ProjectId,
        state: JobState,
        stage: String,
        progress: u8,
        message: String,
    },
    DeployProgress {
        project_id: ProjectId,
        state: JobState,
        stage: String,
        progress: u8,
        message: String,
    },
    GitStatus {
        project_id: ProjectId,
        status: Value,
    },
    SystemNotification {
        level: NotificationLevel,
        message: String,
    },
}

impl HubMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Progress message for a job of the given kind (`buildProgress` or
    /// `deployProgress`).
    pub fn job_progress(
        kind: ProcessKind,
        project_id: &str,
        state: JobState,
        stage: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        let project_id = project_id.to_string();
        let stage = stage.into();
        let message = message.into();
        let progress = progress.min(100);
        match kind {
            ProcessKind::Deploy => Self::DeployProgress {
                project_id,
                state,
                stage,
                progress,
                message,
            },
            _ => Self::BuildProgress {
                project_id,
                state,
                stage,
                progress,
                message,
            },
        }
    }
}

impl From<&OrchestratorError> for HubMessage {
    fn from(err: &OrchestratorError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub message: HubMessage,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(message: HubMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<HubMessage> for Envelope {
    fn from(message: HubMessage) -> Self {
        Self::new(message)
    }
}

/// Inbound message types an observer may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Pong,
    GetInfo,
}

/// A parsed inbound frame, with its optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub message: Inbound,
    pub request_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Failure to interpret an inbound frame. The request id is kept when the
/// frame was valid JSON so the error reply can be correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundError {
    pub code: &'static str,
    pub message: String,
    pub request_id: Option<String>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let raw: RawInbound = serde_json::from_str(text).map_err(|e| InboundError {
            code: "malformed_message",
            message: format!("Malformed message: {}", e),
            request_id: None,
        })?;
        let request_id = raw.request_id;
        let message = match raw.kind.as_str() {
            "subscribe" => Inbound::Subscribe(channel_list(raw.data.as_ref())),
            "unsubscribe" => Inbound::Unsubscribe(channel_list(raw.data.as_ref())),
            "pong" => Inbound::Pong,
            "getInfo" => Inbound::GetInfo,
            other => {
                return Err(InboundError {
                    code: "unknown_message_type",
                    message: format!("Unknown message type: {}", other),
                    request_id,
                });
            }
        };
        if let Inbound::Subscribe(ref list) | Inbound::Unsubscribe(ref list) = message
            && list.is_empty()
        {
            return Err(InboundError {
                code: "malformed_message",
                message: format!("{} requires a channel or channels field", raw.kind),
                request_id,
            });
        }
        Ok(Self {
            message,
            request_id,
        })
    }
}

/// Accepts `{"channel": "..."}`, `{"channels": [...]}` or a bare string.
fn channel_list(data: Option<&Value>) -> Vec<String> {
    let Some(data) = data else {
        return Vec::new();
    };
    if let Some(channel) = data.as_str() {
        return vec![channel.to_string()];
    }
    let mut out = Vec::new();
    if let Some(channel) = data.get("channel").and_then(Value::as_str) {
        out.push(channel.to_string());
    }
    if let Some(list) = data.get("channels").and_then(Value::as_array) {
        out.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    out.retain(|c| !c.is_empty());
    out
}
