//! Protocol normalizer.
//!
//! Bots speak one of two wire versions. V11 is the legacy flat form
//! (`post_type`, ids as numbers or strings, message bodies as code-strings or
//! segment arrays). V12 uses `type`/`detail_type`, a `self` object and segment
//! arrays. Both decode to [`CanonicalEvent`]; unknown fields are kept in
//! `raw` and survive re-rendering.
//!
//! Every error here is per-frame. Callers log and keep reading.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::capability::CapabilityRegistration;
use crate::errors::NormalizeError;
use crate::events::{
    id_to_string, ActionResponse, CanonicalAction, CanonicalEvent, EventKind, Extension,
};
use crate::segment::{parse_codes, plain_text, render_codes, unescape_text, Segment};

pub const DEFAULT_ADMIN_PREFIX: &str = "#";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    V11,
    V12,
}

impl ProtocolVersion {
    /// Version from the `Sec-WebSocket-Protocol` header: `12.*` is V12.
    pub fn from_subprotocol(header: Option<&str>) -> Self {
        match header.map(str::trim) {
            Some(h) if h.starts_with("12") => Self::V12,
            _ => Self::V11,
        }
    }

    /// Lenient parse for query strings and config (`12`, `v12`, `V12`).
    pub fn parse(s: &str) -> Self {
        let s = s.trim().trim_start_matches(['v', 'V']);
        if s.starts_with("12") {
            Self::V12
        } else {
            Self::V11
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V11 => "v11",
            Self::V12 => "v12",
        }
    }
}

/// A decoded inbound Bot frame.
#[derive(Clone, Debug, PartialEq)]
pub enum BotFrame {
    Event(CanonicalEvent),
    /// Reply to an action the gateway forwarded to this Bot.
    Response(ActionResponse),
}

/// A decoded inbound Worker frame.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerFrame {
    Action(CanonicalAction),
    Capabilities(CapabilityRegistration),
    Response(ActionResponse),
    Heartbeat,
}

/// Connection-level defaults applied when a frame omits identity.
#[derive(Clone, Debug, Default)]
pub struct BotIdentity<'a> {
    pub platform: &'a str,
    pub self_id: &'a str,
}

#[derive(Clone, Debug)]
pub struct Normalizer {
    admin_prefix: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_ADMIN_PREFIX)
    }
}

impl Normalizer {
    pub fn new(admin_prefix: impl Into<String>) -> Self {
        Self {
            admin_prefix: admin_prefix.into(),
        }
    }

    pub fn admin_prefix(&self) -> &str {
        &self.admin_prefix
    }

    pub fn decode_bot(
        &self,
        payload: &str,
        version: ProtocolVersion,
        identity: &BotIdentity<'_>,
    ) -> Result<BotFrame, NormalizeError> {
        let value: Value = serde_json::from_str(payload)?;
        self.decode_bot_value(value, version, identity)
    }

    pub fn decode_bot_value(
        &self,
        value: Value,
        version: ProtocolVersion,
        identity: &BotIdentity<'_>,
    ) -> Result<BotFrame, NormalizeError> {
        let Value::Object(obj) = &value else {
            return Err(NormalizeError::NotAnObject);
        };

        let category = match version {
            ProtocolVersion::V11 => str_field(obj, "post_type"),
            ProtocolVersion::V12 => str_field(obj, "type"),
        };

        let Some(category) = category else {
            if is_response(obj) {
                return Ok(BotFrame::Response(decode_response(obj)));
            }
            return Err(NormalizeError::MissingField(match version {
                ProtocolVersion::V11 => "post_type",
                ProtocolVersion::V12 => "type",
            }));
        };

        let kind = EventKind::from_wire(category)
            .ok_or_else(|| NormalizeError::Unrecognized(category.to_string()))?;

        let mut event = match version {
            ProtocolVersion::V11 => decode_v11(obj, kind, identity),
            ProtocolVersion::V12 => decode_v12(obj, kind, identity),
        };
        event.extensions = decode_extensions(obj);
        if !self.admin_prefix.is_empty()
            && event.is_message()
            && event.text.trim_start().starts_with(&self.admin_prefix)
        {
            event.push_extension(Extension::AdminCommand);
        }
        event.raw = value;
        Ok(BotFrame::Event(event))
    }

    pub fn decode_worker(&self, payload: &str) -> Result<WorkerFrame, NormalizeError> {
        let value: Value = serde_json::from_str(payload)?;
        let Value::Object(obj) = value else {
            return Err(NormalizeError::NotAnObject);
        };

        match str_field(&obj, "type") {
            Some("register_capabilities") => {
                let reg: CapabilityRegistration = serde_json::from_value(Value::Object(obj))?;
                return Ok(WorkerFrame::Capabilities(reg));
            }
            Some("heartbeat") => return Ok(WorkerFrame::Heartbeat),
            _ => {}
        }
        if str_field(&obj, "meta_event_type") == Some("heartbeat") {
            return Ok(WorkerFrame::Heartbeat);
        }

        if let Some(action) = str_field(&obj, "action") {
            let self_obj = obj.get("self").and_then(Value::as_object);
            return Ok(WorkerFrame::Action(CanonicalAction {
                action: action.to_string(),
                params: obj.get("params").cloned().unwrap_or_else(|| json!({})),
                echo: obj.get("echo").filter(|e| !e.is_null()).cloned(),
                self_id: obj
                    .get("self_id")
                    .and_then(id_to_string)
                    .or_else(|| self_obj.and_then(|s| s.get("user_id")).and_then(id_to_string))
                    .unwrap_or_default(),
                platform: str_field(&obj, "platform")
                    .or_else(|| self_obj.and_then(|s| s.get("platform")).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_string(),
                reply_to: obj.get("reply_to").and_then(id_to_string),
            }));
        }

        if is_response(&obj) {
            return Ok(WorkerFrame::Response(decode_response(&obj)));
        }

        Err(NormalizeError::Unrecognized(
            str_field(&obj, "type").unwrap_or("<untyped>").to_string(),
        ))
    }
}

fn decode_v11(obj: &Map<String, Value>, kind: EventKind, identity: &BotIdentity<'_>) -> CanonicalEvent {
    let detail_key = match kind {
        EventKind::Message => "message_type",
        EventKind::Notice => "notice_type",
        EventKind::Request => "request_type",
        EventKind::Meta => "meta_event_type",
        EventKind::Log => "log_type",
    };

    let segments = match obj.get("message") {
        Some(Value::String(s)) => parse_codes(s),
        Some(Value::Array(_)) => segments_from(obj.get("message")),
        _ => Vec::new(),
    };
    let text = if segments.is_empty() {
        str_field(obj, "raw_message").map(unescape_text).unwrap_or_default()
    } else {
        plain_text(&segments)
    };

    CanonicalEvent {
        kind,
        detail_type: str_field(obj, detail_key).unwrap_or_default().to_string(),
        sub_type: str_field(obj, "sub_type").unwrap_or_default().to_string(),
        platform: str_field(obj, "platform")
            .unwrap_or(identity.platform)
            .to_string(),
        self_id: id_field(obj, "self_id").unwrap_or_else(|| identity.self_id.to_string()),
        user_id: id_field(obj, "user_id").unwrap_or_default(),
        group_id: id_field(obj, "group_id").unwrap_or_default(),
        message_id: id_field(obj, "message_id").unwrap_or_default(),
        text,
        segments,
        echo: id_field(obj, "echo"),
        time: obj.get("time").and_then(as_unix_seconds).unwrap_or_default(),
        extensions: Vec::new(),
        raw: Value::Null,
    }
}

fn decode_v12(obj: &Map<String, Value>, kind: EventKind, identity: &BotIdentity<'_>) -> CanonicalEvent {
    let self_obj = obj.get("self").and_then(Value::as_object);
    let segments = segments_from(obj.get("message"));
    let text = if segments.is_empty() {
        str_field(obj, "alt_message").unwrap_or_default().to_string()
    } else {
        plain_text(&segments)
    };

    CanonicalEvent {
        kind,
        detail_type: str_field(obj, "detail_type").unwrap_or_default().to_string(),
        sub_type: str_field(obj, "sub_type").unwrap_or_default().to_string(),
        platform: self_obj
            .and_then(|s| s.get("platform"))
            .and_then(Value::as_str)
            .unwrap_or(identity.platform)
            .to_string(),
        self_id: self_obj
            .and_then(|s| s.get("user_id"))
            .and_then(id_to_string)
            .unwrap_or_else(|| identity.self_id.to_string()),
        user_id: id_field(obj, "user_id").unwrap_or_default(),
        group_id: id_field(obj, "group_id").unwrap_or_default(),
        message_id: id_field(obj, "message_id").unwrap_or_default(),
        text,
        segments,
        echo: id_field(obj, "echo"),
        time: obj.get("time").and_then(as_unix_seconds).unwrap_or_default(),
        extensions: Vec::new(),
        raw: Value::Null,
    }
}

fn decode_extensions(obj: &Map<String, Value>) -> Vec<Extension> {
    let mut out = Vec::new();
    if let Some(Value::Array(items)) = obj.get("extensions") {
        for item in items {
            match serde_json::from_value::<Extension>(item.clone()) {
                Ok(ext) => out.push(ext),
                Err(e) => tracing::debug!(error = %e, "skipping unrecognized extension"),
            }
        }
    }
    if let Some(hint) = str_field(obj, "route_hint").filter(|h| !h.is_empty()) {
        out.push(Extension::RouteHint {
            hint: hint.to_string(),
        });
    }
    out
}

fn is_response(obj: &Map<String, Value>) -> bool {
    obj.contains_key("echo") && (obj.contains_key("status") || obj.contains_key("retcode"))
}

fn decode_response(obj: &Map<String, Value>) -> ActionResponse {
    ActionResponse {
        status: str_field(obj, "status").unwrap_or_default().to_string(),
        retcode: obj.get("retcode").and_then(Value::as_i64).unwrap_or_default(),
        data: obj.get("data").cloned().unwrap_or(Value::Null),
        message: str_field(obj, "message")
            .or_else(|| str_field(obj, "msg"))
            .unwrap_or_default()
            .to_string(),
        echo: obj.get("echo").filter(|e| !e.is_null()).cloned(),
    }
}

fn segments_from(value: Option<&Value>) -> Vec<Segment> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<Segment>(item.clone()).ok())
        .collect()
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn id_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(id_to_string)
}

fn as_unix_seconds(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// V11 adapters expect numeric ids where the id is numeric.
fn v11_id(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) if !id.starts_with('0') || id == "0" => Value::from(n),
        _ => Value::String(id.to_string()),
    }
}

/// Render a canonical event back onto the wire.
///
/// Canonical fields are overlaid on `raw`, so fields the normalizer did not
/// model are passed through untouched.
pub fn render_event(event: &CanonicalEvent, version: ProtocolVersion) -> Value {
    let mut obj = match &event.raw {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    match version {
        ProtocolVersion::V11 => {
            let (category, detail_key) = match event.kind {
                EventKind::Message => ("message", "message_type"),
                EventKind::Notice => ("notice", "notice_type"),
                EventKind::Request => ("request", "request_type"),
                EventKind::Meta => ("meta_event", "meta_event_type"),
                EventKind::Log => ("log", "log_type"),
            };
            let _ = obj.insert("post_type".into(), json!(category));
            let _ = obj.insert(detail_key.into(), json!(event.detail_type));
            let _ = obj.insert("self_id".into(), v11_id(&event.self_id));
            if !event.user_id.is_empty() {
                let _ = obj.insert("user_id".into(), v11_id(&event.user_id));
            }
            if !event.group_id.is_empty() {
                let _ = obj.insert("group_id".into(), v11_id(&event.group_id));
            }
            if !event.message_id.is_empty() {
                let _ = obj.insert("message_id".into(), v11_id(&event.message_id));
            }
            if event.is_message() {
                let body = render_codes(&event.segments);
                let _ = obj.insert("message".into(), json!(body));
                let _ = obj.insert("raw_message".into(), json!(body));
            }
        }
        ProtocolVersion::V12 => {
            let _ = obj.insert("type".into(), json!(event.kind.as_str()));
            let _ = obj.insert("detail_type".into(), json!(event.detail_type));
            let _ = obj.insert(
                "self".into(),
                json!({ "platform": event.platform, "user_id": event.self_id }),
            );
            if !event.user_id.is_empty() {
                let _ = obj.insert("user_id".into(), json!(event.user_id));
            }
            if !event.group_id.is_empty() {
                let _ = obj.insert("group_id".into(), json!(event.group_id));
            }
            if !event.message_id.is_empty() {
                let _ = obj.insert("message_id".into(), json!(event.message_id));
            }
            if event.is_message() {
                let _ = obj.insert("message".into(), json!(event.segments));
                let _ = obj.insert("alt_message".into(), json!(event.text));
            }
        }
    }

    let _ = obj.insert("sub_type".into(), json!(event.sub_type));
    let _ = obj.insert("platform".into(), json!(event.platform));
    let _ = obj.insert("time".into(), json!(event.time));
    if let Some(echo) = &event.echo {
        let _ = obj.insert("echo".into(), json!(echo));
    }
    if event.extensions.is_empty() {
        let _ = obj.remove("extensions");
    } else {
        let _ = obj.insert("extensions".into(), json!(event.extensions));
    }
    Value::Object(obj)
}

/// Render a Worker action for delivery to a Bot.
pub fn render_action(action: &CanonicalAction, version: ProtocolVersion) -> Value {
    let mut obj = Map::new();
    let _ = obj.insert("action".into(), json!(action.action));
    let params = if action.params.is_null() {
        json!({})
    } else {
        action.params.clone()
    };
    let _ = obj.insert("params".into(), params);
    if let Some(echo) = &action.echo {
        let _ = obj.insert("echo".into(), echo.clone());
    }
    if version == ProtocolVersion::V12 && !action.self_id.is_empty() {
        let _ = obj.insert(
            "self".into(),
            json!({ "platform": action.platform, "user_id": action.self_id }),
        );
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> BotIdentity<'static> {
        BotIdentity {
            platform: "qq",
            self_id: "100",
        }
    }

    fn event(frame: BotFrame) -> CanonicalEvent {
        match frame {
            BotFrame::Event(ev) => ev,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn version_from_subprotocol() {
        assert_eq!(ProtocolVersion::from_subprotocol(Some("12.onebot")), ProtocolVersion::V12);
        assert_eq!(ProtocolVersion::from_subprotocol(Some("11")), ProtocolVersion::V11);
        assert_eq!(ProtocolVersion::from_subprotocol(None), ProtocolVersion::V11);
        assert_eq!(ProtocolVersion::parse("v12"), ProtocolVersion::V12);
    }

    #[test]
    fn v11_group_message_with_codes() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"message","message_type":"group","sub_type":"normal",
            "self_id":200,"user_id":42,"group_id":7,"message_id":99,
            "message":"hi [CQ:at,qq=200] there","time":1700000000,"font":0}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert_eq!(ev.kind, EventKind::Message);
        assert_eq!(ev.detail_type, "group");
        assert_eq!(ev.self_id, "200");
        assert_eq!(ev.user_id, "42");
        assert_eq!(ev.group_id, "7");
        assert_eq!(ev.message_id, "99");
        assert_eq!(ev.platform, "qq");
        assert_eq!(ev.text, "hi  there");
        assert_eq!(ev.segments.len(), 3);
        assert_eq!(ev.time, 1_700_000_000);
        assert_eq!(ev.raw["font"], 0);
    }

    #[test]
    fn v11_defaults_self_id_from_connection() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"notice","notice_type":"group_increase"}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert_eq!(ev.kind, EventKind::Notice);
        assert_eq!(ev.self_id, "100");
        assert_eq!(ev.detail_type, "group_increase");
    }

    #[test]
    fn v11_meta_event() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"meta_event","meta_event_type":"heartbeat"}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert_eq!(ev.kind, EventKind::Meta);
        assert_eq!(ev.detail_type, "heartbeat");
    }

    #[test]
    fn v12_private_message() {
        let n = Normalizer::default();
        let payload = r#"{"id":"e1","type":"message","detail_type":"private","sub_type":"",
            "self":{"platform":"tg","user_id":"bot9"},"user_id":"u1","message_id":"m1",
            "message":[{"type":"text","data":{"text":"hello"}},{"type":"mention","data":{"user_id":"x"}}],
            "alt_message":"hello@x","time":1700000000.5}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V12, &ident()).unwrap());
        assert_eq!(ev.platform, "tg");
        assert_eq!(ev.self_id, "bot9");
        assert_eq!(ev.text, "hello");
        assert_eq!(ev.segments.len(), 2);
        assert_eq!(ev.time, 1_700_000_000);
        assert!(!ev.is_group());
    }

    #[test]
    fn bot_response_frame() {
        let n = Normalizer::default();
        let payload = r#"{"status":"ok","retcode":0,"data":{"message_id":5},"echo":"w1|abc"}"#;
        match n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap() {
            BotFrame::Response(resp) => {
                assert!(resp.is_ok());
                assert_eq!(resp.echo, Some(json!("w1|abc")));
                assert_eq!(resp.data["message_id"], 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let n = Normalizer::default();
        assert!(matches!(
            n.decode_bot("{nope", ProtocolVersion::V11, &ident()),
            Err(NormalizeError::InvalidJson(_))
        ));
        assert!(matches!(
            n.decode_bot("[1,2]", ProtocolVersion::V11, &ident()),
            Err(NormalizeError::NotAnObject)
        ));
        assert!(matches!(
            n.decode_bot(r#"{"foo":1}"#, ProtocolVersion::V11, &ident()),
            Err(NormalizeError::MissingField("post_type"))
        ));
        assert!(matches!(
            n.decode_bot(r#"{"post_type":"weird"}"#, ProtocolVersion::V11, &ident()),
            Err(NormalizeError::Unrecognized(_))
        ));
    }

    #[test]
    fn admin_prefix_sets_extension() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"message","message_type":"private","user_id":1,"message":"  #reload"}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert!(ev.is_admin_command());

        let custom = Normalizer::new("!");
        let ev = event(custom.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert!(!ev.is_admin_command());
    }

    #[test]
    fn route_hint_and_extensions_decode() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"message","message_type":"private","message":"x",
            "route_hint":"weather","extensions":[{"kind":"shadow","target":"w2"},{"kind":"mystery"}]}"#;
        let ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        assert_eq!(ev.route_hint(), Some("weather"));
        assert_eq!(ev.shadow_target(), Some("w2"));
    }

    #[test]
    fn worker_capability_registration() {
        let n = Normalizer::default();
        let payload = r#"{"type":"register_capabilities","capabilities":[
            {"name":"weather","description":"forecast","parameters":{},"trigger_pattern":"^weather"}],
            "metadata":{"version":"1.0"}}"#;
        match n.decode_worker(payload).unwrap() {
            WorkerFrame::Capabilities(reg) => {
                assert_eq!(reg.names(), vec!["weather"]);
                assert_eq!(reg.capabilities[0].trigger.as_deref(), Some("^weather"));
                assert_eq!(reg.metadata["version"], "1.0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn worker_action_and_heartbeat() {
        let n = Normalizer::default();
        let payload = r#"{"action":"send_group_msg","params":{"group_id":7,"message":"hi"},
            "echo":"mine-1","self_id":200,"reply_to":"evt_1"}"#;
        match n.decode_worker(payload).unwrap() {
            WorkerFrame::Action(a) => {
                assert_eq!(a.action, "send_group_msg");
                assert_eq!(a.self_id, "200");
                assert_eq!(a.echo, Some(json!("mine-1")));
                assert_eq!(a.reply_to.as_deref(), Some("evt_1"));
                assert_eq!(a.group_id().as_deref(), Some("7"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            n.decode_worker(r#"{"type":"heartbeat"}"#).unwrap(),
            WorkerFrame::Heartbeat
        );
        assert!(matches!(
            n.decode_worker(r#"{"type":"mystery"}"#),
            Err(NormalizeError::Unrecognized(_))
        ));
    }

    #[test]
    fn worker_response_frame() {
        let n = Normalizer::default();
        let frame = n.decode_worker(r#"{"status":"ok","retcode":0,"echo":"e"}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::Response(_)));
    }

    #[test]
    fn render_v11_overlays_raw() {
        let n = Normalizer::default();
        let payload = r#"{"post_type":"message","message_type":"group","self_id":200,
            "user_id":42,"group_id":7,"message":"a&amp;b [CQ:face,id=1]","font":3}"#;
        let mut ev = event(n.decode_bot(payload, ProtocolVersion::V11, &ident()).unwrap());
        ev.echo = Some("evt_x".into());
        let out = render_event(&ev, ProtocolVersion::V11);
        assert_eq!(out["post_type"], "message");
        assert_eq!(out["self_id"], 200);
        assert_eq!(out["user_id"], 42);
        assert_eq!(out["message"], "a&amp;b [CQ:face,id=1]");
        assert_eq!(out["font"], 3);
        assert_eq!(out["echo"], "evt_x");
    }

    #[test]
    fn render_v12_uses_segments() {
        let ev = CanonicalEvent {
            kind: EventKind::Message,
            detail_type: "private".into(),
            platform: "tg".into(),
            self_id: "b".into(),
            user_id: "u".into(),
            text: "hi".into(),
            segments: vec![Segment::text("hi")],
            ..Default::default()
        };
        let out = render_event(&ev, ProtocolVersion::V12);
        assert_eq!(out["type"], "message");
        assert_eq!(out["self"]["user_id"], "b");
        assert_eq!(out["message"][0]["type"], "text");
        assert_eq!(out["alt_message"], "hi");
    }

    #[test]
    fn v11_ids_keep_leading_zero_strings() {
        assert_eq!(v11_id("123"), json!(123));
        assert_eq!(v11_id("0123"), json!("0123"));
        assert_eq!(v11_id("abc"), json!("abc"));
    }

    #[test]
    fn render_action_versions() {
        let action = CanonicalAction {
            action: "send_msg".into(),
            params: Value::Null,
            echo: Some(json!("w|1")),
            self_id: "200".into(),
            platform: "qq".into(),
            reply_to: None,
        };
        let v11 = render_action(&action, ProtocolVersion::V11);
        assert_eq!(v11, json!({"action":"send_msg","params":{},"echo":"w|1"}));
        let v12 = render_action(&action, ProtocolVersion::V12);
        assert_eq!(v12["self"]["user_id"], "200");
    }
}
