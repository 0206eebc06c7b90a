//! Policy loading: one source unit in, one admitted policy out.
//!
//! A source unit is a YAML or JSON byte stream holding exactly one policy
//! document. Loading decodes, validates, and hashes in that order; any
//! failure rejects the unit without affecting others. Directory loading
//! walks a tree and collects per-file failures so one broken file cannot
//! take down the rest of the bundle.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use arbiter_contracts::error::{ArbiterError, ArbiterResult};
use arbiter_contracts::policy::{PolicyDocument, PolicyId};

use crate::hash::{content_hash, hash_hex};
use crate::validate::validate_document;

/// The advertised encoding of a policy source unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    fn name(self) -> &'static str {
        match self {
            SourceFormat::Yaml => "yaml",
            SourceFormat::Json => "json",
        }
    }

    /// Infer the format from a file extension.
    pub fn from_path(path: &Path) -> Option<SourceFormat> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Some(SourceFormat::Yaml),
            Some("json") => Some(SourceFormat::Json),
            _ => None,
        }
    }
}

/// A loaded, validated, hashed policy — frozen from here on.
#[derive(Debug, Clone)]
pub struct Policy {
    pub document: PolicyDocument,
    pub id: PolicyId,
    /// 64-bit content hash, identical across YAML/JSON encodings.
    pub hash: u64,
    /// The file this policy came from, when loaded from disk.
    pub source: Option<PathBuf>,
}

/// Load one policy from a byte stream in the advertised format.
pub fn load_policy(bytes: &[u8], format: SourceFormat) -> ArbiterResult<Policy> {
    let json = decode(bytes, format)?;

    let document: PolicyDocument =
        serde_json::from_value(json.clone()).map_err(|e| ArbiterError::MalformedSource {
            format: format.name().to_string(),
            reason: e.to_string(),
        })?;

    validate_document(&document)?;

    let hash = content_hash(&json);
    // The validator guarantees exactly one body, so an identity exists.
    let id = document.id().ok_or_else(|| ArbiterError::MalformedSource {
        format: format.name().to_string(),
        reason: "document has no policy body".to_string(),
    })?;

    debug!(policy = %id, hash = %hash_hex(hash), "policy loaded");

    Ok(Policy { document, id, hash, source: None })
}

/// Load one policy from a file, inferring the format from its extension.
pub fn load_policy_file(path: &Path) -> ArbiterResult<Policy> {
    let format = SourceFormat::from_path(path).ok_or_else(|| ArbiterError::Io {
        path: path.display().to_string(),
        reason: "unrecognised policy file extension".to_string(),
    })?;
    let bytes = fs::read(path).map_err(|e| ArbiterError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut policy = load_policy(&bytes, format)?;
    policy.source = Some(path.to_path_buf());
    Ok(policy)
}

/// The outcome of loading a policy directory.
///
/// Failed files do not abort the load; they are reported alongside the
/// policies that did load so the admitter can decide what to publish.
#[derive(Debug, Default)]
pub struct DirLoad {
    pub policies: Vec<Policy>,
    pub failures: Vec<(PathBuf, ArbiterError)>,
}

/// Recursively load every `.yaml`/`.yml`/`.json` file under `root`.
///
/// Entries whose names start with `.` or `_` are skipped (editor droppings
/// and schema directories). Traversal order is sorted for determinism.
pub fn load_policy_dir(root: &Path) -> ArbiterResult<DirLoad> {
    let mut result = DirLoad::default();
    walk(root, &mut result)?;
    debug!(
        root = %root.display(),
        loaded = result.policies.len(),
        failed = result.failures.len(),
        "policy directory loaded"
    );
    Ok(result)
}

fn walk(dir: &Path, result: &mut DirLoad) -> ArbiterResult<()> {
    let entries = fs::read_dir(dir).map_err(|e| ArbiterError::Io {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }

        if path.is_dir() {
            walk(&path, result)?;
        } else if SourceFormat::from_path(&path).is_some() {
            match load_policy_file(&path) {
                Ok(policy) => result.policies.push(policy),
                Err(error) => {
                    warn!(file = %path.display(), %error, "policy file rejected");
                    result.failures.push((path, error));
                }
            }
        }
    }
    Ok(())
}

/// Decode the byte stream into a JSON value, rejecting multi-document
/// streams.
fn decode(bytes: &[u8], format: SourceFormat) -> ArbiterResult<serde_json::Value> {
    match format {
        SourceFormat::Json => {
            serde_json::from_slice(bytes).map_err(|e| ArbiterError::MalformedSource {
                format: "json".to_string(),
                reason: e.to_string(),
            })
        }
        SourceFormat::Yaml => {
            use serde::Deserialize;

            let mut documents: Vec<serde_yaml::Value> = Vec::new();
            for de in serde_yaml::Deserializer::from_slice(bytes) {
                let value = serde_yaml::Value::deserialize(de).map_err(|e| {
                    ArbiterError::MalformedSource {
                        format: "yaml".to_string(),
                        reason: e.to_string(),
                    }
                })?;
                documents.push(value);
                if documents.len() > 1 {
                    return Err(ArbiterError::MultipleDocuments);
                }
            }

            let single = documents.pop().ok_or_else(|| ArbiterError::MalformedSource {
                format: "yaml".to_string(),
                reason: "empty document".to_string(),
            })?;

            serde_json::to_value(single).map_err(|e| ArbiterError::MalformedSource {
                format: "yaml".to_string(),
                reason: format!("document is not JSON-compatible: {e}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESOURCE_POLICY_YAML: &str = r#"
apiVersion: api.cerbos.dev/v1
jsonSchema: https://api.cerbos.dev/latest/cerbos/policy/v1/Policy.schema.json
resourcePolicy:
  resource: leave_request
  version: "20210210"
  importDerivedRoles:
    - beta
  rules:
    - actions: ["*"]
      effect: EFFECT_ALLOW
      roles:
        - admin
    - name: approve-pending
      actions: ["approve"]
      effect: EFFECT_ALLOW
      derivedRoles:
        - direct_manager
      condition:
        match:
          expr: request.resource.attr.status == "PENDING_APPROVAL"
"#;

    const RESOURCE_POLICY_JSON: &str = r#"{
  "apiVersion": "api.cerbos.dev/v1",
  "resourcePolicy": {
    "resource": "leave_request",
    "version": "20210210",
    "importDerivedRoles": ["beta"],
    "rules": [
      { "actions": ["*"], "effect": "EFFECT_ALLOW", "roles": ["admin"] },
      {
        "name": "approve-pending",
        "actions": ["approve"],
        "effect": "EFFECT_ALLOW",
        "derivedRoles": ["direct_manager"],
        "condition": {
          "match": { "expr": "request.resource.attr.status == \"PENDING_APPROVAL\"" }
        }
      }
    ]
  }
}"#;

    #[test]
    fn loads_a_yaml_resource_policy() {
        let policy = load_policy(RESOURCE_POLICY_YAML.as_bytes(), SourceFormat::Yaml).unwrap();
        assert_eq!(policy.id.to_string(), "resource.leave_request.v20210210");
        let rp = policy.document.resource_policy.as_ref().unwrap();
        assert_eq!(rp.rules.len(), 2);
        assert_eq!(rp.rules[1].name, "approve-pending");
    }

    #[test]
    fn yaml_and_json_encodings_hash_identically() {
        // The YAML carries a jsonSchema annotation the JSON lacks; the hash
        // excludes it, so the two logical policies are identical.
        let yaml = load_policy(RESOURCE_POLICY_YAML.as_bytes(), SourceFormat::Yaml).unwrap();
        let json = load_policy(RESOURCE_POLICY_JSON.as_bytes(), SourceFormat::Json).unwrap();
        assert_eq!(yaml.hash, json.hash);
        assert_eq!(yaml.id, json.id);
    }

    #[test]
    fn multi_document_streams_are_rejected() {
        let stream = format!("{RESOURCE_POLICY_YAML}\n---\n{RESOURCE_POLICY_YAML}");
        let err = load_policy(stream.as_bytes(), SourceFormat::Yaml).unwrap_err();
        assert!(matches!(err, ArbiterError::MultipleDocuments));
        assert_eq!(err.to_string(), "multiple policies in one file");
    }

    #[test]
    fn unknown_fields_are_a_load_error() {
        let doc = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: x
  version: default
  rules: []
  notAField: true
"#;
        let err = load_policy(doc.as_bytes(), SourceFormat::Yaml).unwrap_err();
        match err {
            ArbiterError::MalformedSource { format, reason } => {
                assert_eq!(format, "yaml");
                assert!(reason.contains("notAField"), "reason was: {reason}");
            }
            other => panic!("expected MalformedSource, got {other:?}"),
        }
    }

    #[test]
    fn structural_failures_surface_from_load() {
        let doc = r#"
apiVersion: api.cerbos.dev/v1
resourcePolicy:
  resource: x
  version: "not a version"
  rules: []
"#;
        let err = load_policy(doc.as_bytes(), SourceFormat::Yaml).unwrap_err();
        assert!(matches!(err, ArbiterError::Validation { .. }));
    }

    #[test]
    fn empty_yaml_is_malformed() {
        let err = load_policy(b"", SourceFormat::Yaml).unwrap_err();
        assert!(matches!(err, ArbiterError::MalformedSource { .. }));
    }

    #[test]
    fn directory_loading_collects_failures_per_file() {
        let root = std::env::temp_dir().join(format!("arbiter-loader-{}", std::process::id()));
        let nested = root.join("acme");
        fs::create_dir_all(&nested).unwrap();

        fs::write(root.join("good.yaml"), RESOURCE_POLICY_YAML).unwrap();
        fs::write(nested.join("also_good.json"), RESOURCE_POLICY_JSON).unwrap();
        fs::write(root.join("broken.yaml"), "apiVersion: wrong\n").unwrap();
        fs::write(root.join("_ignored.yaml"), "not a policy").unwrap();
        fs::write(root.join("README.md"), "not a policy").unwrap();

        let result = load_policy_dir(&root).unwrap();
        assert_eq!(result.policies.len(), 2);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].0.ends_with("broken.yaml"));

        fs::remove_dir_all(&root).unwrap();
    }
}
