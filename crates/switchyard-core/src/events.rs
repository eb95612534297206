use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::segment::Segment;

/// Top-level category of an inbound Bot event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Message,
    Notice,
    Request,
    Meta,
    Log,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Request => "request",
            Self::Meta => "meta",
            Self::Log => "log",
        }
    }

    /// Map a wire category onto a kind. V11 uses `meta_event`, V12 uses `meta`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "message" | "message_sent" => Some(Self::Message),
            "notice" => Some(Self::Notice),
            "request" => Some(Self::Request),
            "meta" | "meta_event" => Some(Self::Meta),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

/// Cross-cutting hints attached to an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extension {
    /// Names a capability or a Worker id that should receive the event.
    RouteHint { hint: String },
    /// Push a non-blocking duplicate to a second Worker.
    Shadow { target: String },
    /// Text began with the admin prefix.
    AdminCommand,
    Other { key: String, value: Value },
}

/// Protocol-independent shape of every inbound Bot event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub detail_type: String,
    pub sub_type: String,
    pub platform: String,
    pub self_id: String,
    pub user_id: String,
    pub group_id: String,
    pub message_id: String,
    pub text: String,
    pub segments: Vec<Segment>,
    pub echo: Option<String>,
    pub time: i64,
    pub extensions: Vec<Extension>,
    /// Original decoded payload; unknown fields survive re-rendering.
    pub raw: Value,
}

impl CanonicalEvent {
    pub fn is_group(&self) -> bool {
        !self.group_id.is_empty()
    }

    pub fn is_message(&self) -> bool {
        self.kind == EventKind::Message
    }

    /// Mint a process-unique echo when the event has none.
    pub fn ensure_echo(&mut self) -> &str {
        if self.echo.as_deref().is_none_or(str::is_empty) {
            self.echo = Some(format!("evt_{}", Uuid::now_v7()));
        }
        self.echo.as_deref().unwrap_or_default()
    }

    /// Deduplication identity: `platform:self_id:message_id`, else the echo.
    pub fn message_identity(&self) -> Option<String> {
        if !self.message_id.is_empty() {
            return Some(format!(
                "{}:{}:{}",
                self.platform, self.self_id, self.message_id
            ));
        }
        self.echo.clone().filter(|e| !e.is_empty())
    }

    pub fn route_hint(&self) -> Option<&str> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::RouteHint { hint } => Some(hint.as_str()),
            _ => None,
        })
    }

    pub fn shadow_target(&self) -> Option<&str> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Shadow { target } => Some(target.as_str()),
            _ => None,
        })
    }

    pub fn is_admin_command(&self) -> bool {
        self.extensions
            .iter()
            .any(|ext| matches!(ext, Extension::AdminCommand))
    }

    pub fn push_extension(&mut self, ext: Extension) {
        if !self.extensions.contains(&ext) {
            self.extensions.push(ext);
        }
    }
}

/// A Worker-initiated call into a Bot's native API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalAction {
    pub action: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub self_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub platform: String,
    /// Echo of the dispatched event this action answers, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl CanonicalAction {
    /// Group id named by the params, if any.
    pub fn group_id(&self) -> Option<String> {
        self.params.get("group_id").and_then(id_to_string)
    }

    pub fn user_id(&self) -> Option<String> {
        self.params.get("user_id").and_then(id_to_string)
    }
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_FAILED: &str = "failed";

pub const RETCODE_NO_ROUTE: i64 = 1404;
pub const RETCODE_WRITE_FAILED: i64 = 1502;
pub const RETCODE_TIMEOUT: i64 = 1504;

/// Reply to an action, in either direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionResponse {
    pub status: String,
    pub retcode: i64,
    pub data: Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<Value>,
}

impl ActionResponse {
    pub fn ok(data: Value, echo: Option<Value>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            retcode: 0,
            data,
            message: String::new(),
            echo,
        }
    }

    pub fn failed(retcode: i64, message: impl Into<String>, echo: Option<Value>) -> Self {
        Self {
            status: STATUS_FAILED.to_string(),
            retcode,
            data: Value::Null,
            message: message.into(),
            echo,
        }
    }

    pub fn timeout(echo: Option<Value>) -> Self {
        Self::failed(RETCODE_TIMEOUT, "request timed out", echo)
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK && self.retcode == 0
    }
}

/// Ids arrive as JSON numbers or strings depending on the adapter.
pub fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
