//! The persisted configuration and its on-disk record format.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use tandem_common::{ActionKind, Error, Result, ResourceId};

use crate::entry::ConfigEntry;

/// Record format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatVersion(pub u32);

impl FormatVersion {
    /// Current record format version.
    pub const CURRENT: Self = Self(0);

    /// Records written by a newer build cannot be read safely.
    pub fn is_supported(&self) -> bool {
        *self <= Self::CURRENT
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Durable per-resource settings and global action toggles.
///
/// Legacy records that used `remoteConfigList` / `disabledActions` are
/// accepted on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfiguration {
    #[serde(default, alias = "remoteConfigList")]
    pub entries: BTreeMap<ResourceId, ConfigEntry>,
    #[serde(default, alias = "disabledActions")]
    pub disabled_action_kinds: BTreeSet<ActionKind>,
}

/// Wrapper stored under the store key.
#[derive(Debug, Deserialize)]
struct PersistedRecord {
    state: PersistedConfiguration,
    #[serde(default)]
    version: FormatVersion,
}

impl PersistedConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: &ResourceId) -> Option<&ConfigEntry> {
        self.entries.get(id)
    }

    pub fn is_disabled(&self, kind: ActionKind) -> bool {
        self.disabled_action_kinds.contains(&kind)
    }

    /// Encode as a versioned record.
    pub fn to_record_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            state: &'a PersistedConfiguration,
            version: FormatVersion,
        }

        Ok(serde_json::to_string(&Borrowed {
            state: self,
            version: FormatVersion::CURRENT,
        })?)
    }

    /// Decode a versioned record.
    ///
    /// # Errors
    /// - Returns error if the text is not a well-formed record
    /// - Returns error if the record was written by a newer format version
    pub fn from_record_json(json: &str) -> Result<Self> {
        let record: PersistedRecord = serde_json::from_str(json)?;
        if !record.version.is_supported() {
            return Err(Error::Serialization(format!(
                "Unsupported configuration format version {} (current is {})",
                record.version.0,
                FormatVersion::CURRENT.0
            )));
        }
        Ok(record.state)
    }
}
