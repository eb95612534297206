use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One skill a Worker advertises.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Regex over the event text that routes matching events straight here.
    #[serde(alias = "trigger_pattern", skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

/// Full capability list sent by a Worker; replaces any previous list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityRegistration {
    pub capabilities: Vec<Capability>,
    pub metadata: Value,
}

impl CapabilityRegistration {
    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_pattern_alias() {
        let cap: Capability = serde_json::from_value(json!({
            "name": "weather",
            "trigger_pattern": "^天气"
        }))
        .unwrap();
        assert_eq!(cap.trigger.as_deref(), Some("^天气"));
    }

    #[test]
    fn registration_defaults() {
        let reg: CapabilityRegistration = serde_json::from_value(json!({})).unwrap();
        assert!(reg.capabilities.is_empty());
        assert!(reg.metadata.is_null());
    }

    #[test]
    fn names_in_order() {
        let reg = CapabilityRegistration {
            capabilities: vec![
                Capability { name: "a".into(), ..Default::default() },
                Capability { name: "b".into(), ..Default::default() },
            ],
            metadata: Value::Null,
        };
        assert_eq!(reg.names(), vec!["a", "b"]);
    }
}
