//! Opaque per-resource configuration entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tandem_common::{Error, Result};

/// Top-level keys understood by the presentation layer.
///
/// The store never interprets them; they are listed so callers agree on
/// spelling.
pub mod keys {
    pub const HIDE_TRAY: &str = "hideTray";
    pub const DISABLED_ACTIONS: &str = "disabledActions";
    pub const DEFAULT_REMOTE_PATH: &str = "defaultRemotePath";
    pub const DEFAULT_MOUNT_POINT: &str = "defaultMountPoint";
    pub const MOUNT_ON_START: &str = "mountOnStart";
    pub const MOUNT_DEFAULTS: &str = "mountDefaults";
    pub const VFS_DEFAULTS: &str = "vfsDefaults";
    pub const FILTER_DEFAULTS: &str = "filterDefaults";
    pub const COPY_DEFAULTS: &str = "copyDefaults";
    pub const SYNC_DEFAULTS: &str = "syncDefaults";
}

/// Key-ordered bag of settings for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigEntry(Map<String, Value>);

impl ConfigEntry {
    /// Create an empty entry.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build an entry from a JSON value.
    ///
    /// # Errors
    /// - Returns error if `value` is not a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidInput(format!(
                "Config entry must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Parse an entry from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Shallow merge: every top-level key of `partial` replaces the same key
    /// here. Nested objects are replaced, not merged.
    pub fn merge(&mut self, partial: ConfigEntry) {
        for (key, value) in partial.0 {
            self.0.insert(key, value);
        }
    }

    /// Consuming form of [`ConfigEntry::merge`].
    pub fn merged(mut self, partial: ConfigEntry) -> Self {
        self.merge(partial);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for ConfigEntry {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for ConfigEntry {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_merge_overrides_and_keeps_other_keys() {
        let existing = ConfigEntry::new().with("k", "v1").with("j", "v3");
        let merged = existing.merged(ConfigEntry::new().with("k", "v2"));

        assert_eq!(merged.into_value(), json!({"k": "v2", "j": "v3"}));
    }

    #[test]
    fn test_merge_is_shallow() {
        let existing = ConfigEntry::new().with(keys::MOUNT_DEFAULTS, json!({"a": 1, "b": 2}));
        let merged = existing.merged(ConfigEntry::new().with(keys::MOUNT_DEFAULTS, json!({"c": 3})));

        assert_eq!(merged.get(keys::MOUNT_DEFAULTS), Some(&json!({"c": 3})));
    }

    #[test]
    fn test_from_value_requires_object() {
        assert!(ConfigEntry::from_value(json!({"hideTray": true})).is_ok());
        assert!(matches!(
            ConfigEntry::from_value(json!([1, 2])),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            ConfigEntry::from_json("{broken"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let entry = ConfigEntry::new().with(keys::HIDE_TRAY, true);
        assert_eq!(serde_json::to_string(&entry).unwrap(), r#"{"hideTray":true}"#);
    }

    fn disjoint_partials() -> impl Strategy<Value = Vec<ConfigEntry>> {
        // Distinct keys across partials: partial i owns keys "p{i}_*".
        prop::collection::vec(prop::collection::vec(any::<i64>(), 1..4), 1..6).prop_map(|groups| {
            groups
                .into_iter()
                .enumerate()
                .map(|(i, values)| {
                    values
                        .into_iter()
                        .enumerate()
                        .map(|(j, v)| (format!("p{}_{}", i, j), Value::from(v)))
                        .collect()
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_disjoint_merges_commute(partials in disjoint_partials(), seed in any::<u64>()) {
            let forward = partials
                .iter()
                .cloned()
                .fold(ConfigEntry::new(), ConfigEntry::merged);

            let mut shuffled = partials.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            let permuted = shuffled
                .into_iter()
                .fold(ConfigEntry::new(), ConfigEntry::merged);

            let union: ConfigEntry = partials
                .into_iter()
                .flat_map(|p| p.0.into_iter())
                .collect();

            prop_assert_eq!(&forward, &union);
            prop_assert_eq!(&permuted, &union);
        }
    }
}
