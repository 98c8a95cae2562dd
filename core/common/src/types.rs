//! Common types used throughout Tandem.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one configured remote (e.g. `"gdrive"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a new ResourceId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ResourceId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Extract the resource id from a remote path such as `gdrive:photos/2024`.
    pub fn from_remote_path(path: &str) -> crate::Result<Self> {
        let name = path.split(':').next().unwrap_or_default();
        Self::new(name)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl FromStr for ResourceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// Identifier of one window taking part in a shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(Uuid);

impl WindowId {
    /// Generate a fresh random window id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of action a user may disable globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Mount,
    Sync,
    Copy,
    Serve,
}

impl ActionKind {
    /// All action kinds, in declaration order.
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Mount,
        ActionKind::Sync,
        ActionKind::Copy,
        ActionKind::Serve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Mount => "mount",
            ActionKind::Sync => "sync",
            ActionKind::Copy => "copy",
            ActionKind::Serve => "serve",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown action kind: {}", s)))
    }
}
