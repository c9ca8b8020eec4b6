use std::collections::BTreeSet;
use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::types::FingerprintConfig;
use crate::state::models::{ProjectState, Resource, ResourceKind};

/// Stable content hash over resources.
///
/// The resource is rendered to a canonical JSON form (object keys sorted at
/// every depth, ignored fields dropped at every depth, optionally restricted to
/// a set of top-level fields), wrapped together with its kind and hashed with
/// SHA-256. Two fingerprints are equal iff the canonical documents are
/// byte-equal.
#[derive(Debug, Clone)]
pub struct FingerprintEngine {
    ignore_fields: BTreeSet<String>,
    include_fields: BTreeSet<String>,
}

impl Default for FingerprintEngine {
    fn default() -> Self {
        Self::new(&FingerprintConfig::default())
    }
}

impl FingerprintEngine {
    pub fn new(config: &FingerprintConfig) -> Self {
        Self {
            ignore_fields: config.ignore_metadata_fields.iter().cloned().collect(),
            include_fields: config.include_fields.iter().cloned().collect(),
        }
    }

    /// Fingerprint any serializable resource representation.
    pub fn compute_fingerprint<T: Serialize>(&self, resource: &T, kind: ResourceKind) -> Result<String> {
        let value = serde_json::to_value(resource)
            .with_context(|| format!("Failed to serialize {} for fingerprinting", kind))?;
        Ok(self.fingerprint_value(&value, kind))
    }

    /// Fingerprint a resource envelope.
    pub fn fingerprint_resource(&self, resource: &Resource) -> Result<String> {
        self.compute_fingerprint(resource, resource.kind)
    }

    pub fn fingerprint_value(&self, value: &Value, kind: ResourceKind) -> String {
        let document = self.canonical_document(value, kind);
        hex::encode(Sha256::digest(document.as_bytes()))
    }

    /// Exact hash input: `{"kind":<kind>,"resource":<canonical form>}`.
    pub fn canonical_document(&self, value: &Value, kind: ResourceKind) -> String {
        let mut out = String::from("{\"kind\":");
        write_json_string(kind.as_str(), &mut out);
        out.push_str(",\"resource\":");
        out.push_str(&self.canonical_form(value));
        out.push('}');
        out
    }

    /// Content fingerprint of a whole project: hash over the per-resource
    /// fingerprints in (kind, name) order.
    pub fn fingerprint_state(&self, state: &ProjectState) -> Result<String> {
        let mut entries = Vec::with_capacity(state.len());
        for resource in state.resources() {
            entries.push((resource.key(), self.fingerprint_resource(resource)?));
        }
        entries.sort();

        let mut hasher = Sha256::new();
        hasher.update(state.project_id.as_bytes());
        for (key, fingerprint) in &entries {
            hasher.update(b"\n");
            hasher.update(key.to_string().as_bytes());
            hasher.update(b"=");
            hasher.update(fingerprint.as_bytes());
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Canonical serialization used as hash input.
    pub fn canonical_form(&self, value: &Value) -> String {
        let mut out = String::new();
        match value {
            Value::Object(map) if !self.include_fields.is_empty() => {
                let filtered: serde_json::Map<String, Value> = map
                    .iter()
                    .filter(|(k, _)| self.include_fields.contains(k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.write_canonical(&Value::Object(filtered), &mut out);
            }
            other => self.write_canonical(other, &mut out),
        }
        out
    }

    fn write_canonical(&self, value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map
                    .keys()
                    .filter(|k| !self.ignore_fields.contains(k.as_str()))
                    .collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_json_string(key, out);
                    out.push(':');
                    if let Some(v) = map.get(key.as_str()) {
                        self.write_canonical(v, out);
                    }
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    self.write_canonical(item, out);
                }
                out.push(']');
            }
            Value::String(s) => write_json_string(s, out),
            Value::Number(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Null => out.push_str("null"),
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json escaping of a plain string cannot fail
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let engine = FingerprintEngine::default();
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(
            engine.fingerprint_value(&a, ResourceKind::Cluster),
            engine.fingerprint_value(&b, ResourceKind::Cluster)
        );
    }

    #[test]
    fn ignored_fields_are_dropped_at_any_depth() {
        let engine = FingerprintEngine::default();
        let a = json!({"spec": {"size": "M10", "updatedAt": "2024-01-01"}, "createdAt": "x"});
        let b = json!({"spec": {"size": "M10", "updatedAt": "2025-06-01"}, "createdAt": "y"});
        assert_eq!(engine.canonical_form(&a), engine.canonical_form(&b));
        assert_eq!(engine.canonical_form(&a), r#"{"spec":{"size":"M10"}}"#);
    }

    #[test]
    fn include_fields_restrict_top_level() {
        let engine = FingerprintEngine::new(&FingerprintConfig {
            include_fields: vec!["spec".to_string()],
            ..Default::default()
        });
        let a = json!({"spec": {"size": "M10"}, "metadata": {"name": "a"}});
        let b = json!({"spec": {"size": "M10"}, "metadata": {"name": "b"}});
        assert_eq!(
            engine.fingerprint_value(&a, ResourceKind::Cluster),
            engine.fingerprint_value(&b, ResourceKind::Cluster)
        );
    }

    #[test]
    fn kind_participates_in_hash() {
        let engine = FingerprintEngine::default();
        let v = json!({"name": "same"});
        assert_ne!(
            engine.fingerprint_value(&v, ResourceKind::Cluster),
            engine.fingerprint_value(&v, ResourceKind::DatabaseUser)
        );
    }

    #[test]
    fn fingerprint_is_lowercase_sha256_hex() {
        let fp = FingerprintEngine::default().fingerprint_value(&json!({}), ResourceKind::Project);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
