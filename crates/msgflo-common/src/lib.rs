use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod logging;

/// A named input or output of a participant, bound to a broker address.
///
/// `queue` is the broker-level address (AMQP queue/exchange name, MQTT topic).
/// If left empty at registration time it is derived by [`Definition::normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(rename = "type")]
    pub port_type: String,
    #[serde(default)]
    pub queue: String,
}

impl Port {
    pub fn new(id: impl Into<String>, port_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            port_type: port_type.into(),
            queue: String::new(),
        }
    }
}

/// A participant's declared shape: role, component, ports.
///
/// Field order matters: this is serialized to the discovery channel and the
/// order `id, role, component, label, icon, inports, outports` is part of the
/// wire protocol, not just a Rust convenience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub id: String,
    pub role: String,
    pub component: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    pub inports: Vec<Port>,
    pub outports: Vec<Port>,
}

fn default_icon() -> String {
    "file-word-o".to_string()
}

impl Default for Definition {
    fn default() -> Self {
        Self {
            id: String::new(),
            role: String::new(),
            component: String::new(),
            label: String::new(),
            icon: default_icon(),
            inports: vec![Port::new("in", "any")],
            outports: vec![Port::new("out", "any"), Port::new("error", "error")],
        }
    }
}

impl Definition {
    /// Starts a default-shaped definition (one `in:any` inport, `out:any` +
    /// `error:error` outports) for the given role/component.
    pub fn new(role: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            component: component.into(),
            ..Default::default()
        }
    }

    /// Returns a new, normalized `Definition`; never mutates `self`.
    ///
    /// - Assigns `id = "{role}-{random8}"` if `id` is empty.
    /// - Derives `queue = "{role}.{UPPERCASE(id)}"` for any port with an empty queue.
    ///
    /// Idempotent: normalizing an already-normalized definition is a no-op.
    pub fn normalize(&self) -> Self {
        let id = if self.id.is_empty() {
            format!("{}-{}", self.role, random_suffix())
        } else {
            self.id.clone()
        };

        let normalize_ports = |ports: &[Port]| -> Vec<Port> {
            ports
                .iter()
                .map(|p| {
                    let mut p = p.clone();
                    if p.queue.is_empty() {
                        p.queue = format!("{}.{}", self.role, p.id.to_uppercase());
                    }
                    p
                })
                .collect()
        };

        Self {
            id,
            role: self.role.clone(),
            component: self.component.clone(),
            label: self.label.clone(),
            icon: self.icon.clone(),
            inports: normalize_ports(&self.inports),
            outports: normalize_ports(&self.outports),
        }
    }

    /// Validates the invariants enforced at registration time (spec §3).
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "definition id must not be empty after normalization".into(),
            ));
        }
        if self.role.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "definition role must not be empty".into(),
            ));
        }
        for port in self.inports.iter().chain(self.outports.iter()) {
            if port.queue.is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "port '{}' has an empty queue after normalization",
                    port.id
                )));
            }
        }
        let mut in_ids = std::collections::HashSet::new();
        for port in &self.inports {
            if !in_ids.insert(&port.id) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate inport id '{}'",
                    port.id
                )));
            }
        }
        let mut out_ids = std::collections::HashSet::new();
        for port in &self.outports {
            if !out_ids.insert(&port.id) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate outport id '{}'",
                    port.id
                )));
            }
        }
        Ok(())
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// The fixed discovery destination all participants announce themselves on.
pub const DISCOVERY_DESTINATION: &str = "fbp";

/// `{"protocol":"discovery","command":"participant","payload":<Definition>}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub protocol: &'static str,
    pub command: &'static str,
    pub payload: Definition,
}

impl DiscoveryMessage {
    pub fn for_definition(definition: Definition) -> Self {
        Self {
            protocol: "discovery",
            command: "participant",
            payload: definition,
        }
    }
}

/// Error taxonomy shared by every msgflo crate (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("missing broker configuration: {0}")]
    MissingConfig(String),

    #[error("unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid participant definition: {0}")]
    InvalidDefinition(String),

    #[error("unknown port '{0}' on participant '{1}'")]
    UnknownPort(String, String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("participant handler panicked: {0}")]
    HandlerPanic(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_definition_has_spec_default_ports() {
        let def = Definition::default();
        assert_eq!(def.inports.len(), 1);
        assert_eq!(def.inports[0].id, "in");
        assert_eq!(def.outports.len(), 2);
        assert_eq!(def.outports[0].id, "out");
        assert_eq!(def.outports[1].id, "error");
        assert_eq!(def.icon, "file-word-o");
        assert_eq!(def.label, "");
    }

    #[test]
    fn normalize_derives_missing_queue() {
        let def = Definition::new("repeat", "CppRepeat");
        let normalized = def.normalize();
        assert_eq!(normalized.inports[0].queue, "repeat.IN");
        assert_eq!(normalized.outports[0].queue, "repeat.OUT");
        assert_eq!(normalized.outports[1].queue, "repeat.ERROR");
    }

    #[test]
    fn normalize_assigns_id_when_empty() {
        let def = Definition::new("repeat", "CppRepeat");
        assert!(def.id.is_empty());
        let normalized = def.normalize();
        assert!(normalized.id.starts_with("repeat-"));
        assert_eq!(normalized.id.len(), "repeat-".len() + 8);
    }

    #[test]
    fn normalize_preserves_explicit_queue() {
        let mut def = Definition::new("repeat", "CppRepeat");
        def.inports[0].queue = "custom.queue".to_string();
        let normalized = def.normalize();
        assert_eq!(normalized.inports[0].queue, "custom.queue");
    }

    #[test]
    fn normalize_is_idempotent() {
        let def = Definition::new("repeat", "CppRepeat");
        let once = def.normalize();
        let twice = once.normalize();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_never_mutates_caller() {
        let def = Definition::new("repeat", "CppRepeat");
        let before = def.clone();
        let _ = def.normalize();
        assert_eq!(def, before);
    }

    #[test]
    fn validate_rejects_empty_role() {
        let def = Definition::new("", "CppRepeat").normalize();
        assert!(matches!(def.validate(), Err(EngineError::InvalidDefinition(_))));
    }

    #[test]
    fn validate_rejects_duplicate_port_ids() {
        let mut def = Definition::new("repeat", "CppRepeat").normalize();
        def.inports.push(Port {
            id: "in".to_string(),
            port_type: "any".to_string(),
            queue: "repeat.IN2".to_string(),
        });
        assert!(matches!(def.validate(), Err(EngineError::InvalidDefinition(_))));
    }

    #[test]
    fn validate_accepts_normalized_default() {
        let def = Definition::new("repeat", "CppRepeat").normalize();
        assert!(def.validate().is_ok());
    }

    #[test]
    fn discovery_json_field_order_is_stable() {
        // `serde_json::to_value` round-trips through a `Map` (a `BTreeMap`
        // without the `preserve_order` feature), which re-sorts keys
        // alphabetically and would falsely fail this check. The wire format
        // is whatever direct struct serialization produces, so assert on
        // that directly.
        let def = Definition::new("repeat", "CppRepeat").normalize();
        let msg = DiscoveryMessage::for_definition(def);
        let json = serde_json::to_string(&msg).unwrap();
        let payload_start = json.find("\"payload\":").unwrap();
        let payload_json = &json[payload_start..];

        let id_pos = payload_json.find("\"id\":").unwrap();
        let role_pos = payload_json.find("\"role\":").unwrap();
        let component_pos = payload_json.find("\"component\":").unwrap();
        let label_pos = payload_json.find("\"label\":").unwrap();
        let icon_pos = payload_json.find("\"icon\":").unwrap();
        let inports_pos = payload_json.find("\"inports\":").unwrap();
        let outports_pos = payload_json.find("\"outports\":").unwrap();

        assert!(id_pos < role_pos);
        assert!(role_pos < component_pos);
        assert!(component_pos < label_pos);
        assert!(label_pos < icon_pos);
        assert!(icon_pos < inports_pos);
        assert!(inports_pos < outports_pos);
    }

    #[test]
    fn discovery_json_round_trips() {
        let def = Definition::new("repeat", "CppRepeat").normalize();
        let msg = DiscoveryMessage::for_definition(def.clone());
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: DiscoveryMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.payload, def);
        assert_eq!(parsed.protocol, "discovery");
        assert_eq!(parsed.command, "participant");
    }
}
