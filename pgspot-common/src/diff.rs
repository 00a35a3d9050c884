//! Structural diff between two manifests.
//!
//! Both sides are serialized to JSON, engine-computed fields are dropped and
//! `null` entries are treated as absent, so an older snapshot that predates a
//! new optional field does not show up as a change.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::{InstanceManifest, INTERNAL_MANIFEST_FIELDS};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueChange {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Dotted path (`vm.cpu_min`, `os.extra_packages`) -> change.
pub type ManifestDiff = BTreeMap<String, ValueChange>;

pub fn diff_manifests(old: &InstanceManifest, new: &InstanceManifest) -> ManifestDiff {
    diff_values(&old.to_json_value(), &new.to_json_value())
}

pub fn diff_values(old: &Value, new: &Value) -> ManifestDiff {
    let mut out = ManifestDiff::new();
    walk("", Some(&normalize(old, true)), Some(&normalize(new, true)), &mut out);
    out
}

/// True when anything under `section` (e.g. `vm`) changed.
pub fn section_changed(diff: &ManifestDiff, section: &str) -> bool {
    let prefix = format!("{}.", section);
    diff.keys().any(|k| k == section || k.starts_with(&prefix))
}

fn normalize(value: &Value, top_level: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if top_level && INTERNAL_MANIFEST_FIELDS.contains(&k.as_str()) {
                    continue;
                }
                if v.is_null() {
                    continue;
                }
                out.insert(k.clone(), normalize(v, false));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, false)).collect()),
        other => other.clone(),
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn walk(path: &str, old: Option<&Value>, new: Option<&Value>, out: &mut ManifestDiff) {
    match (old, new) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            for (k, va) in a {
                walk(&join(path, k), Some(va), b.get(k), out);
            }
            for (k, vb) in b {
                if !a.contains_key(k) {
                    walk(&join(path, k), None, Some(vb), out);
                }
            }
        }
        (Some(a), Some(b)) if a == b => {}
        (None, None) => {}
        (a, b) => {
            // Lists are compared as a whole, a reordered list is a change.
            out.insert(
                path.to_string(),
                ValueChange {
                    old: a.cloned(),
                    new: b.cloned(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(yaml: &str) -> InstanceManifest {
        InstanceManifest::from_yaml_str(yaml).unwrap()
    }

    const BASE: &str = r#"
region: eu-north-1
instance_name: pg1
vm:
  cpu_min: 2
  storage_min: 50
os:
  extra_packages: [htop]
"#;

    #[test]
    fn diff_with_itself_is_empty() {
        let m = manifest(BASE);
        assert!(diff_manifests(&m, &m).is_empty());
    }

    #[test]
    fn internal_fields_never_show_up() {
        let a = manifest(BASE);
        let mut b = a.clone();
        b.instance_uuid = Some(uuid::Uuid::new_v4());
        b.manifest_snapshot_id = Some(42);
        b.session_vars.insert("tick".into(), "3".into());
        assert!(diff_manifests(&a, &b).is_empty());
        assert!(diff_manifests(&b, &a).is_empty());
    }

    #[test]
    fn nested_change_is_reported_with_path() {
        let a = manifest(BASE);
        let mut b = a.clone();
        b.vm.cpu_min = Some(4);
        b.os.extra_packages.push("jq".into());

        let d = diff_manifests(&a, &b);
        assert_eq!(d.len(), 2);
        assert_eq!(
            d.get("vm.cpu_min"),
            Some(&ValueChange {
                old: Some(json!(2)),
                new: Some(json!(4))
            })
        );
        assert!(d.contains_key("os.extra_packages"));
        assert!(section_changed(&d, "vm"));
        assert!(section_changed(&d, "os"));
        assert!(!section_changed(&d, "postgres"));
    }

    #[test]
    fn emptiness_is_symmetric() {
        let a = manifest(BASE);
        let mut variants = vec![a.clone()];
        let mut b = a.clone();
        b.description = Some("added".into());
        variants.push(b);
        let mut c = a.clone();
        c.user_tags.insert("k".into(), "v".into());
        variants.push(c);

        for x in &variants {
            for y in &variants {
                assert_eq!(
                    diff_manifests(x, y).is_empty(),
                    diff_manifests(y, x).is_empty()
                );
            }
        }
    }

    #[test]
    fn missing_and_null_are_equivalent() {
        let old = json!({"instance_name": "pg1", "vm": {"cpu_min": 2}});
        let new = json!({"instance_name": "pg1", "vm": {"cpu_min": 2, "max_price": null}});
        assert!(diff_values(&old, &new).is_empty());
    }

    #[test]
    fn added_and_removed_keys() {
        let old = json!({"user_tags": {"a": "1"}});
        let new = json!({"user_tags": {"b": "2"}});
        let d = diff_values(&old, &new);
        assert_eq!(d.get("user_tags.a").unwrap().new, None);
        assert_eq!(d.get("user_tags.b").unwrap().old, None);
    }
}
