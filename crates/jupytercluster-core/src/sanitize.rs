//! Sanitization of user-supplied Helm value overrides.
//!
//! Overrides are untrusted. The validator keeps only allow-listed top-level
//! sections and removes, at any depth:
//!
//! - any key naming a namespace (the namespace is derived from the hub name
//!   and passed to helm as `--namespace`)
//! - cluster-scoped RBAC (`clusterRoles`, `clusterRoleBindings`, objects of
//!   kind `ClusterRole` / `ClusterRoleBinding`)
//! - embedded raw manifests (maps carrying `apiVersion` + `kind`)
//! - privilege-escalation settings (`privileged`, `capabilities`, host
//!   namespaces, `hostPath`)
//! - release identity overrides (`nameOverride`, `fullnameOverride`)
//!
//! Anything ambiguous is removed rather than passed through. Every removal
//! or rewrite is returned as an [`AuditEntry`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ClusterError, Result};
use crate::types::HubIdentity;

/// Top-level sections a user may override.
pub const DEFAULT_ALLOWED_SECTIONS: &[&str] = &[
    "hub",
    "proxy",
    "singleuser",
    "ingress",
    "httpRoute",
    "scheduling",
    "prePuller",
    "cull",
    "rbac",
];

/// Sections the chart schema requires to be present as maps.
pub const REQUIRED_SECTIONS: &[&str] = &["hub", "proxy", "singleuser", "ingress"];

const MAX_DEPTH: usize = 32;

const PRIVILEGE_KEYS: &[&str] = &[
    "privileged",
    "allowprivilegeescalation",
    "capabilities",
    "hostnetwork",
    "hostpid",
    "hostipc",
    "hostpath",
];

const RBAC_KEYS: &[&str] = &["create", "enabled"];

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Removed,
    Rewritten,
}

/// One stripped or rewritten override field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Dotted path into the override document, with `[i]` for list items.
    pub path: String,
    pub action: AuditAction,
    pub reason: String,
}

/// Result of sanitization: the values to apply and what was changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub values: Value,
    pub audit: Vec<AuditEntry>,
}

struct Audit<'a> {
    namespace: &'a str,
    entries: Vec<AuditEntry>,
}

impl Audit<'_> {
    fn record(&mut self, path: &str, action: AuditAction, reason: &str) {
        warn!(
            namespace = self.namespace,
            path,
            action = ?action,
            reason,
            "override field sanitized"
        );
        self.entries.push(AuditEntry {
            path: path.to_string(),
            action,
            reason: reason.to_string(),
        });
    }

    fn removed(&mut self, path: &str, reason: &str) {
        self.record(path, AuditAction::Removed, reason);
    }

    fn rewritten(&mut self, path: &str, reason: &str) {
        self.record(path, AuditAction::Rewritten, reason);
    }
}

// ---------------------------------------------------------------------------
// SecurityValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SecurityValidator {
    allowed_sections: BTreeSet<String>,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_SECTIONS.iter().copied())
    }
}

impl SecurityValidator {
    pub fn new<I, S>(allowed_sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_sections: allowed_sections.into_iter().map(Into::into).collect(),
        }
    }

    /// Sanitize `overrides` for the hub identified by `identity`.
    ///
    /// `null` is treated as an empty document; any other non-mapping value
    /// is a validation error.
    pub fn sanitize(&self, overrides: &Value, identity: &HubIdentity) -> Result<Sanitized> {
        let mut audit = Audit {
            namespace: &identity.namespace,
            entries: Vec::new(),
        };

        let top = match overrides {
            Value::Null => {
                return Ok(Sanitized {
                    values: Value::Object(Map::new()),
                    audit: Vec::new(),
                })
            }
            Value::Object(map) => map,
            other => {
                return Err(ClusterError::Validation(format!(
                    "override document must be a mapping, got {}",
                    type_name(other)
                )))
            }
        };

        let mut out = Map::new();
        for (key, value) in top {
            if let Some(reason) = denied_key(key) {
                audit.removed(key, reason);
                continue;
            }
            if !self.allowed_sections.contains(key) {
                audit.removed(key, "top-level section is not in the allow-list");
                continue;
            }
            let cleaned = if key == "rbac" {
                clean_rbac(value, &mut audit)
            } else {
                clean_value(value, key, 1, &mut audit)
            };
            if let Some(v) = cleaned {
                out.insert(key.clone(), v);
            }
        }

        normalize(&mut out, &mut audit);

        Ok(Sanitized {
            values: Value::Object(out),
            audit: audit.entries,
        })
    }
}

fn denied_key(key: &str) -> Option<&'static str> {
    let lower = key.to_ascii_lowercase();
    if lower.contains("namespace") {
        Some("namespace is derived from the hub name")
    } else if lower.contains("clusterrole") {
        Some("cluster-scoped RBAC is not allowed")
    } else if PRIVILEGE_KEYS.contains(&lower.as_str()) {
        Some("privilege escalation is not allowed")
    } else if lower == "nameoverride" || lower == "fullnameoverride" {
        Some("release identity is derived from the hub name")
    } else {
        None
    }
}

fn denied_object(map: &Map<String, Value>) -> Option<&'static str> {
    if let Some(Value::String(kind)) = map.get("kind") {
        if kind.eq_ignore_ascii_case("ClusterRole")
            || kind.eq_ignore_ascii_case("ClusterRoleBinding")
        {
            return Some("cluster-scoped RBAC is not allowed");
        }
        if map.contains_key("apiVersion") {
            return Some("embedded manifests are not allowed");
        }
    }
    None
}

fn clean_value(value: &Value, path: &str, depth: usize, audit: &mut Audit<'_>) -> Option<Value> {
    if depth > MAX_DEPTH {
        audit.removed(path, "nesting is deeper than allowed");
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(reason) = denied_object(map) {
                audit.removed(path, reason);
                return None;
            }
            let mut out = Map::new();
            for (key, child) in map {
                let child_path = format!("{path}.{key}");
                if let Some(reason) = denied_key(key) {
                    audit.removed(&child_path, reason);
                    continue;
                }
                if let Some(v) = clean_value(child, &child_path, depth + 1, audit) {
                    out.insert(key.clone(), v);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let child_path = format!("{path}[{i}]");
                if let Some(v) = clean_value(item, &child_path, depth + 1, audit) {
                    out.push(v);
                }
            }
            Some(Value::Array(out))
        }
        scalar => Some(scalar.clone()),
    }
}

/// `rbac` may only toggle namespace-scoped RBAC creation.
fn clean_rbac(value: &Value, audit: &mut Audit<'_>) -> Option<Value> {
    let Value::Object(map) = value else {
        audit.removed("rbac", "rbac must be a mapping");
        return None;
    };
    let mut out = Map::new();
    for (key, child) in map {
        let path = format!("rbac.{key}");
        if let Some(reason) = denied_key(key) {
            audit.removed(&path, reason);
        } else if !RBAC_KEYS.contains(&key.as_str()) {
            audit.removed(&path, "only rbac.create and rbac.enabled may be set");
        } else if !child.is_boolean() {
            audit.removed(&path, "rbac flags must be booleans");
        } else {
            out.insert(key.clone(), child.clone());
        }
    }
    Some(Value::Object(out))
}

fn normalize(values: &mut Map<String, Value>, audit: &mut Audit<'_>) {
    // Gateway API CRDs are not guaranteed to exist on the cluster.
    disable_http_route(values.get_mut("httpRoute"), "httpRoute.enabled", audit);
    if let Some(Value::Object(hub)) = values.get_mut("hub") {
        disable_http_route(hub.get_mut("httpRoute"), "hub.httpRoute.enabled", audit);
    }

    let storage = values
        .get_mut("singleuser")
        .and_then(Value::as_object_mut)
        .and_then(|s| s.get_mut("storage"))
        .and_then(Value::as_object_mut);
    if let Some(storage) = storage {
        for key in ["extraVolumes", "extraVolumeMounts"] {
            if let Some(v) = storage.get_mut(key) {
                if v.as_object().is_some_and(Map::is_empty) {
                    *v = Value::Array(Vec::new());
                    audit.rewritten(
                        &format!("singleuser.storage.{key}"),
                        "empty mapping converted to an empty list",
                    );
                }
            }
        }
    }
}

fn disable_http_route(route: Option<&mut Value>, path: &str, audit: &mut Audit<'_>) {
    let Some(Value::Object(route)) = route else {
        return;
    };
    if route.get("enabled").and_then(Value::as_bool) == Some(true) {
        route.insert("enabled".into(), Value::Bool(false));
        audit.rewritten(path, "Gateway API routes are disabled");
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

// ---------------------------------------------------------------------------
// Parsing and rendering
// ---------------------------------------------------------------------------

/// Parse an override document given as YAML or JSON text.
pub fn parse_overrides(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value: Value = serde_yaml::from_str(text)
        .map_err(|e| ClusterError::Validation(format!("overrides are not valid YAML or JSON: {e}")))?;
    Ok(match value {
        Value::Null => Value::Object(Map::new()),
        other => other,
    })
}

/// Merge operator defaults under sanitized user values into the document
/// handed to helm.
pub fn render_values(defaults: &Value, sanitized: &Value) -> Value {
    let mut map = defaults.as_object().cloned().unwrap_or_default();
    if let Value::Object(overlay) = sanitized {
        merge_maps(&mut map, overlay);
    }

    for section in REQUIRED_SECTIONS {
        match map.get(*section) {
            Some(Value::Object(_)) => {}
            Some(_) => {
                warn!(section, "required values section is not a mapping; replacing");
                map.insert((*section).to_string(), Value::Object(Map::new()));
            }
            None => {
                map.insert((*section).to_string(), Value::Object(Map::new()));
            }
        }
    }
    map.remove("namespace");
    Value::Object(map)
}

fn merge_maps(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => merge_maps(existing, nested),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> HubIdentity {
        HubIdentity::derive("test-hub-1", "jupyterhub-", "jupyterhub-").unwrap()
    }

    fn sanitize(v: Value) -> Sanitized {
        SecurityValidator::default().sanitize(&v, &identity()).unwrap()
    }

    /// True if any key names a namespace or any cluster-scoped RBAC remains.
    fn has_forbidden(value: &Value) -> bool {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(kind)) = map.get("kind") {
                    if kind.to_ascii_lowercase().starts_with("clusterrole") {
                        return true;
                    }
                }
                map.iter().any(|(k, v)| {
                    let k = k.to_ascii_lowercase();
                    k.contains("namespace") || k.contains("clusterrole") || has_forbidden(v)
                })
            }
            Value::Array(items) => items.iter().any(has_forbidden),
            _ => false,
        }
    }

    #[test]
    fn keeps_allowed_sections_and_drops_unknown() {
        let out = sanitize(json!({
            "hub": {"config": {}},
            "proxy": {"service": {}},
            "forbidden": {"key": "value"},
        }));
        assert!(out.values.get("hub").is_some());
        assert!(out.values.get("proxy").is_some());
        assert!(out.values.get("forbidden").is_none());
        assert_eq!(out.audit.len(), 1);
        assert_eq!(out.audit[0].path, "forbidden");
        assert_eq!(out.audit[0].action, AuditAction::Removed);
    }

    #[test]
    fn discards_namespace_and_cluster_role_bindings() {
        let out = sanitize(json!({
            "namespace": "kube-system",
            "rbac": {"clusterRoleBindings": [{"name": "hack"}], "create": true},
        }));
        assert!(out.values.get("namespace").is_none());
        assert_eq!(out.values["rbac"], json!({"create": true}));
        assert!(!has_forbidden(&out.values));
        let paths: Vec<_> = out.audit.iter().map(|a| a.path.as_str()).collect();
        assert!(paths.contains(&"namespace"));
        assert!(paths.contains(&"rbac.clusterRoleBindings"));
    }

    #[test]
    fn rbac_allows_only_boolean_flags() {
        let out = sanitize(json!({
            "rbac": {"enabled": true, "create": "yes", "roles": [{"name": "x"}]},
        }));
        assert_eq!(out.values["rbac"], json!({"enabled": true}));
        assert_eq!(out.audit.len(), 2);
    }

    #[test]
    fn nested_namespace_keys_are_removed() {
        let out = sanitize(json!({
            "hub": {
                "extraConfig": {"namespace": "other"},
                "networkPolicy": {"egress": [{"to": [{"namespaceSelector": {}}]}]},
                "namespaceOverride": "kube-system",
            }
        }));
        assert!(!has_forbidden(&out.values));
        assert!(out.values["hub"]["extraConfig"].as_object().unwrap().is_empty());
        assert!(out
            .audit
            .iter()
            .any(|a| a.path == "hub.networkPolicy.egress[0].to[0].namespaceSelector"));
    }

    #[test]
    fn cluster_role_objects_in_lists_are_removed() {
        let out = sanitize(json!({
            "hub": {
                "extraObjects": [
                    {"kind": "ClusterRoleBinding", "roleRef": {"name": "cluster-admin"}},
                    {"kind": "clusterrole"},
                    {"name": "harmless"},
                ]
            }
        }));
        assert_eq!(out.values["hub"]["extraObjects"], json!([{"name": "harmless"}]));
    }

    #[test]
    fn embedded_manifests_are_removed() {
        let out = sanitize(json!({
            "singleuser": {
                "extraResources": [
                    {"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "evil"}},
                    {"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "RoleBinding"},
                ]
            }
        }));
        assert_eq!(out.values["singleuser"]["extraResources"], json!([]));
        assert!(out
            .audit
            .iter()
            .all(|a| a.reason == "embedded manifests are not allowed"));
    }

    #[test]
    fn privilege_escalation_keys_are_removed() {
        let out = sanitize(json!({
            "singleuser": {
                "securityContext": {
                    "privileged": true,
                    "allowPrivilegeEscalation": true,
                    "capabilities": {"add": ["SYS_ADMIN"]},
                    "runAsUser": 1000,
                },
                "extraPodConfig": {"hostNetwork": true},
            }
        }));
        assert_eq!(
            out.values["singleuser"]["securityContext"],
            json!({"runAsUser": 1000})
        );
        assert_eq!(out.values["singleuser"]["extraPodConfig"], json!({}));
    }

    #[test]
    fn release_name_overrides_are_removed() {
        let out = sanitize(json!({"hub": {"fullnameOverride": "other", "nameOverride": "x"}}));
        assert_eq!(out.values["hub"], json!({}));
    }

    #[test]
    fn deep_nesting_is_cut_off() {
        let mut doc = json!("leaf");
        for _ in 0..40 {
            doc = json!({"nested": doc});
        }
        let out = sanitize(json!({"hub": doc}));
        assert!(out
            .audit
            .iter()
            .any(|a| a.reason == "nesting is deeper than allowed"));
    }

    #[test]
    fn forbidden_content_never_survives_at_any_depth() {
        for depth in 0..40 {
            let mut doc = json!({
                "namespace": format!("ns-{depth}"),
                "clusterRoleBindings": [{"name": "x"}],
                "items": [{"kind": "ClusterRoleBinding"}, {"targetNamespace": "kube-system"}],
            });
            for _ in 0..depth {
                doc = json!({"inner": doc, "namespace": "kube-system"});
            }
            for section in ["hub", "singleuser", "rbac", "proxy"] {
                let mut top = Map::new();
                top.insert(section.to_string(), doc.clone());
                top.insert("namespace".to_string(), json!("kube-system"));
                let out = sanitize(Value::Object(top));
                assert!(
                    !has_forbidden(&out.values),
                    "depth {depth} section {section}: {}",
                    out.values
                );
            }
        }
    }

    #[test]
    fn http_route_is_disabled() {
        let out = sanitize(json!({
            "httpRoute": {"enabled": true},
            "hub": {"httpRoute": {"enabled": true}},
        }));
        assert_eq!(out.values["httpRoute"]["enabled"], json!(false));
        assert_eq!(out.values["hub"]["httpRoute"]["enabled"], json!(false));
        assert!(out.audit.iter().all(|a| a.action == AuditAction::Rewritten));
    }

    #[test]
    fn empty_volume_maps_become_lists() {
        let out = sanitize(json!({
            "singleuser": {"storage": {"extraVolumes": {}, "extraVolumeMounts": {}}}
        }));
        assert_eq!(out.values["singleuser"]["storage"]["extraVolumes"], json!([]));
        assert_eq!(
            out.values["singleuser"]["storage"]["extraVolumeMounts"],
            json!([])
        );
    }

    #[test]
    fn non_mapping_documents_are_rejected() {
        let validator = SecurityValidator::default();
        let err = validator.sanitize(&json!(["hub"]), &identity()).unwrap_err();
        assert!(matches!(err, ClusterError::Validation(_)));
        let out = validator.sanitize(&Value::Null, &identity()).unwrap();
        assert_eq!(out.values, json!({}));
    }

    #[test]
    fn custom_allow_list_is_respected() {
        let validator = SecurityValidator::new(["hub"]);
        let out = validator
            .sanitize(&json!({"hub": {}, "proxy": {}}), &identity())
            .unwrap();
        assert_eq!(out.values, json!({"hub": {}}));
    }

    #[test]
    fn parse_accepts_yaml_and_json() {
        let yaml = parse_overrides("hub:\n  config:\n    a: 1\n").unwrap();
        assert_eq!(yaml, json!({"hub": {"config": {"a": 1}}}));
        let json_doc = parse_overrides(r#"{"proxy": {"service": {}}}"#).unwrap();
        assert_eq!(json_doc, json!({"proxy": {"service": {}}}));
        assert_eq!(parse_overrides("  ").unwrap(), json!({}));
        assert!(parse_overrides("hub: [unterminated").is_err());
    }

    #[test]
    fn render_merges_defaults_and_fills_required_sections() {
        let defaults = json!({
            "hub": {"config": {"JupyterHub": {"authenticator_class": "dummy"}}},
            "singleuser": "bogus",
            "namespace": "operator-typo",
        });
        let user = json!({"hub": {"config": {"JupyterHub": {"admin_access": true}}}});
        let rendered = render_values(&defaults, &user);
        assert_eq!(
            rendered["hub"]["config"]["JupyterHub"],
            json!({"authenticator_class": "dummy", "admin_access": true})
        );
        for section in REQUIRED_SECTIONS {
            assert!(rendered[*section].is_object(), "{section}");
        }
        assert!(rendered.get("namespace").is_none());
    }
}
