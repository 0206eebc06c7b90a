//! The schema registry: JSON Schema documents addressable by reference.
//!
//! Policies reference schemas as `cerbos:///<name>` URIs. Schemas are
//! compiled once at registration — a malformed schema document is rejected
//! up front rather than surfacing per request. Validation collects every
//! violation before returning so callers see the full failure set in one
//! pass.

use std::collections::HashMap;

use tracing::{debug, warn};

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::request::{AttrValidationError, ValidationSource};

/// URI prefix every schema reference must carry.
const SCHEME_PREFIX: &str = "cerbos:///";

/// A store of compiled schema validators, keyed by schema name.
#[derive(Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, jsonschema::Validator>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register `schema` under `name`.
    ///
    /// The schema becomes addressable as `cerbos:///<name>`. Registering
    /// the same name twice replaces the previous document.
    pub fn register(&mut self, name: &str, schema: &serde_json::Value) -> ArbiterResult<()> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| ArbiterError::SchemaInvalid {
                reference: format!("{SCHEME_PREFIX}{name}"),
                reason: e.to_string(),
            })?;
        debug!(schema = %name, "schema registered");
        self.validators.insert(name.to_string(), validator);
        Ok(())
    }

    /// True when `reference` resolves against this registry.
    pub fn contains(&self, reference: &str) -> bool {
        Self::strip_scheme(reference)
            .map(|name| self.validators.contains_key(name))
            .unwrap_or(false)
    }

    /// Validate an attribute document against the referenced schema.
    ///
    /// Returns the collected violations — an empty list means the document
    /// conforms. An unresolvable reference is an error: the policy declared
    /// a schema the registry does not hold.
    pub fn validate(
        &self,
        reference: &str,
        source: ValidationSource,
        attributes: &serde_json::Value,
    ) -> ArbiterResult<Vec<AttrValidationError>> {
        let name = Self::strip_scheme(reference).ok_or_else(|| ArbiterError::NoSuchSchema {
            reference: reference.to_string(),
        })?;
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| ArbiterError::NoSuchSchema {
                reference: reference.to_string(),
            })?;

        let errors: Vec<AttrValidationError> = validator
            .iter_errors(attributes)
            .map(|error| AttrValidationError {
                source,
                path: error.instance_path.to_string(),
                message: error.to_string(),
            })
            .collect();

        if !errors.is_empty() {
            warn!(
                schema = %name,
                source = ?source,
                violations = errors.len(),
                "attribute validation failed"
            );
        }

        Ok(errors)
    }

    fn strip_scheme(reference: &str) -> Option<&str> {
        reference.strip_prefix(SCHEME_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leave_request_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "status": { "type": "string" },
                "geography": { "type": "string" },
                "owner": { "type": "string" }
            },
            "required": ["status", "owner"]
        })
    }

    #[test]
    fn conforming_attributes_produce_no_errors() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("leave_request.json", &leave_request_schema())
            .unwrap();

        let errors = registry
            .validate(
                "cerbos:///leave_request.json",
                ValidationSource::Resource,
                &json!({ "status": "PENDING_APPROVAL", "owner": "john" }),
            )
            .unwrap();
        assert!(errors.is_empty());
    }

    #[test]
    fn violations_carry_source_and_path() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("leave_request.json", &leave_request_schema())
            .unwrap();

        let errors = registry
            .validate(
                "cerbos:///leave_request.json",
                ValidationSource::Resource,
                &json!({ "status": 42 }),
            )
            .unwrap();

        // One type violation and one missing required property.
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.source == ValidationSource::Resource));
        assert!(errors.iter().any(|e| e.path == "/status"));
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let registry = SchemaRegistry::new();
        let err = registry
            .validate(
                "cerbos:///missing.json",
                ValidationSource::Principal,
                &json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NoSuchSchema { .. }));
    }

    #[test]
    fn non_cerbos_scheme_is_rejected() {
        let registry = SchemaRegistry::new();
        let err = registry
            .validate("https://elsewhere/x.json", ValidationSource::Principal, &json!({}))
            .unwrap_err();
        assert!(matches!(err, ArbiterError::NoSuchSchema { .. }));
    }

    #[test]
    fn malformed_schema_documents_are_rejected_at_registration() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register("bad.json", &json!({ "type": "not-a-type" }))
            .unwrap_err();
        assert!(matches!(err, ArbiterError::SchemaInvalid { .. }));
    }

    #[test]
    fn contains_resolves_full_references() {
        let mut registry = SchemaRegistry::new();
        registry
            .register("principal.json", &json!({ "type": "object" }))
            .unwrap();
        assert!(registry.contains("cerbos:///principal.json"));
        assert!(!registry.contains("cerbos:///other.json"));
        assert!(!registry.contains("principal.json"));
    }
}
