//! Versioned, kind-tagged desired and current state documents.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value};

use crate::error::{Error, Result};

/// Kind and version discriminators present at the top of every document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Common {
    pub kind: String,
    pub version: String,
}

impl Common {
    pub fn new(kind: &str, version: &str) -> Self {
        Self {
            kind: kind.to_string(),
            version: version.to_string(),
        }
    }
}

/// A document subtree whose shape is decided by its kind.
///
/// The raw value is kept so that adapters can back-fill defaults before
/// decoding into their typed schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tree {
    pub common: Common,
    pub value: Value,
}

impl Tree {
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("document has no kind"))?
            .to_string();
        let version = value
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation(format!("document of kind {kind} has no version")))?
            .to_string();
        Ok(Self {
            common: Common { kind, version },
            value,
        })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_value(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.value)?)
    }

    /// Encodes a typed document. `kind` and `version` are written first.
    pub fn encode<T: Serialize>(common: &Common, body: &T) -> Result<Self> {
        let mut mapping = Mapping::new();
        mapping.insert("kind".into(), common.kind.clone().into());
        mapping.insert("version".into(), common.version.clone().into());
        match serde_yaml::to_value(body)? {
            Value::Mapping(fields) => {
                for (k, v) in fields {
                    if k.as_str() == Some("kind") || k.as_str() == Some("version") {
                        continue;
                    }
                    mapping.insert(k, v);
                }
            }
            Value::Null => {}
            other => {
                mapping.insert("spec".into(), other);
            }
        }
        Ok(Self {
            common: common.clone(),
            value: Value::Mapping(mapping),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_yaml::from_value(self.value.clone())?)
    }

    /// Rewrites the version discriminator, used when upgrading old schemas.
    pub fn set_version(&mut self, version: &str) {
        self.common.version = version.to_string();
        if let Value::Mapping(m) = &mut self.value {
            m.insert("version".into(), version.into());
        }
    }

    /// Inserts `default` at `path` unless a value is already present.
    ///
    /// Missing intermediate mappings are created. Returns whether anything was
    /// inserted, which callers report as a migration.
    pub fn backfill(&mut self, path: &[&str], default: Value) -> bool {
        backfill(&mut self.value, path, default)
    }
}

pub fn backfill(value: &mut Value, path: &[&str], default: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut cursor = value;
    for key in parents {
        if !cursor.is_mapping() {
            *cursor = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(m) = cursor else {
            unreachable!("cursor was just made a mapping");
        };
        cursor = m
            .entry(Value::from(*key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    if !cursor.is_mapping() {
        *cursor = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(m) = cursor else {
        unreachable!("cursor was just made a mapping");
    };
    match m.get(*last) {
        Some(v) if !v.is_null() => false,
        _ => {
            m.insert(Value::from(*last), default);
            true
        }
    }
}

impl Serialize for Tree {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Tree::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A secret value inside a desired document.
///
/// Encryption is handled outside of orbiter; values arrive here decrypted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Secret paths to their values, merged across all kinds of an orb.
pub type Secrets = BTreeMap<String, Secret>;

pub fn append_secrets(prefix: &str, into: &mut Secrets, from: Secrets) {
    for (path, secret) in from {
        let key = if prefix.is_empty() {
            path
        } else {
            format!("{prefix}.{path}")
        };
        into.insert(key, secret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_requires_kind() {
        let err = Tree::from_yaml("version: v0\nspec: {}\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_backfill_only_missing() {
        let mut tree = Tree::from_yaml(
            "kind: orbiter.io/StaticProvider\nversion: v1\nspec:\n  verbose: true\n",
        )
        .unwrap();
        assert!(tree.backfill(&["spec", "externalInterfaces"], Value::Sequence(vec![])));
        assert!(!tree.backfill(&["spec", "verbose"], Value::Bool(false)));
        assert_eq!(tree.value["spec"]["verbose"], Value::Bool(true));
        assert!(tree.value["spec"]["externalInterfaces"].is_sequence());
    }

    #[test]
    fn test_backfill_creates_parents() {
        let mut tree = Tree::from_yaml("kind: a/B\nversion: v0\n").unwrap();
        assert!(tree.backfill(&["spec", "networking", "podCidr"], "100.64.0.0/10".into()));
        assert_eq!(
            tree.value["spec"]["networking"]["podCidr"].as_str(),
            Some("100.64.0.0/10")
        );
    }

    #[test]
    fn test_encode_puts_discriminators_first() {
        #[derive(Serialize)]
        struct Body {
            spec: BTreeMap<String, u32>,
        }
        let tree = Tree::encode(
            &Common::new("orbiter.io/Orb", "v0"),
            &Body {
                spec: BTreeMap::from([("a".to_string(), 1)]),
            },
        )
        .unwrap();
        let yaml = tree.to_yaml().unwrap();
        assert!(yaml.starts_with("kind: orbiter.io/Orb\nversion: v0\n"), "{yaml}");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(***)");
    }

    #[test]
    fn test_append_secrets_prefixes_paths() {
        let mut all = Secrets::new();
        append_secrets(
            "providers.static",
            &mut all,
            Secrets::from([("maintenancekeyprivate".to_string(), Secret::new("k"))]),
        );
        assert!(all.contains_key("providers.static.maintenancekeyprivate"));
    }
}
