//! Storage keys
//!
//! A storage key is an opaque locator. Two forms exist:
//!
//! ```text
//! volatile://!1:test/backing@                                  plain key
//! reference-mode://{volatile://backing}{volatile://container}  compound key
//! ```
//!
//! The compound form addresses one logical store split into a backing
//! location (full payloads keyed by id) and a container location (pointers).

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKey {
    Plain {
        protocol: String,
        location: String,
    },
    ReferenceMode {
        backing: Box<StorageKey>,
        container: Box<StorageKey>,
    },
}

impl StorageKey {
    pub fn plain(protocol: impl Into<String>, location: impl Into<String>) -> Self {
        StorageKey::Plain {
            protocol: protocol.into(),
            location: location.into(),
        }
    }

    pub fn volatile(location: impl Into<String>) -> Self {
        StorageKey::plain("volatile", location)
    }

    pub fn reference_mode(backing: StorageKey, container: StorageKey) -> Self {
        StorageKey::ReferenceMode {
            backing: Box::new(backing),
            container: Box::new(container),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            StorageKey::Plain { protocol, .. } => protocol,
            StorageKey::ReferenceMode { .. } => REFERENCE_MODE_PROTOCOL,
        }
    }

    pub fn is_reference_mode(&self) -> bool {
        matches!(self, StorageKey::ReferenceMode { .. })
    }

    /// Backing and container halves of a compound key.
    pub fn split(&self) -> Option<(&StorageKey, &StorageKey)> {
        match self {
            StorageKey::ReferenceMode { backing, container } => Some((backing, container)),
            StorageKey::Plain { .. } => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        let (protocol, rest) = s
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidStorageKey(s.to_string()))?;
        if protocol.is_empty() {
            return Err(StorageError::InvalidStorageKey(s.to_string()));
        }
        if protocol != REFERENCE_MODE_PROTOCOL {
            return Ok(StorageKey::plain(protocol, rest));
        }

        let parts = split_braced(rest).ok_or_else(|| StorageError::InvalidStorageKey(s.to_string()))?;
        match parts.as_slice() {
            [backing, container] => Ok(StorageKey::reference_mode(
                StorageKey::parse(backing)?,
                StorageKey::parse(container)?,
            )),
            _ => Err(StorageError::InvalidStorageKey(s.to_string())),
        }
    }
}

/// Split `{a}{b}...` into its top-level braced groups, honoring nesting.
fn split_braced(s: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    parts.push(&s[start..i]);
                }
            }
            _ if depth == 0 => return None,
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    Some(parts)
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Plain { protocol, location } => write!(f, "{}://{}", protocol, location),
            StorageKey::ReferenceMode { backing, container } => {
                write!(f, "{}://{{{}}}{{{}}}", REFERENCE_MODE_PROTOCOL, backing, container)
            }
        }
    }
}

impl FromStr for StorageKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKey::parse(s)
    }
}
