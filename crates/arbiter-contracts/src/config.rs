//! Engine configuration.
//!
//! Deserializable from YAML or JSON. Every field has a default so an empty
//! document is a valid configuration.

use serde::{Deserialize, Serialize};

/// Tunable engine behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Version used for policy lookup when the request does not name one.
    #[serde(default = "default_policy_version")]
    pub default_policy_version: String,

    /// How attribute-schema violations affect decisions.
    #[serde(default)]
    pub schema_validation: SchemaEnforcement,

    /// Interval for source re-polling, when the hosting process drives
    /// reloads. The engine itself only consumes published snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reload_interval_sec: Option<u64>,

    /// Whether decisions should be handed to an audit sink by the host.
    #[serde(default)]
    pub audit_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy_version: default_policy_version(),
            schema_validation: SchemaEnforcement::default(),
            reload_interval_sec: None,
            audit_enabled: false,
        }
    }
}

fn default_policy_version() -> String {
    "default".to_string()
}

/// What the engine does when declared attribute schemas are violated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaEnforcement {
    /// Skip validation entirely.
    None,
    /// Validate and report, but decide as if validation passed.
    #[default]
    Warn,
    /// Validation errors convert every requested action to DENY.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.default_policy_version, "default");
        assert_eq!(config.schema_validation, SchemaEnforcement::Warn);
        assert_eq!(config.reload_interval_sec, None);
        assert!(!config.audit_enabled);
    }

    #[test]
    fn enforcement_modes_use_lowercase_names() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "schemaValidation": "error",
            "auditEnabled": true
        }))
        .unwrap();
        assert_eq!(config.schema_validation, SchemaEnforcement::Error);
        assert!(config.audit_enabled);
    }
}
