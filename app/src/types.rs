//! Shared identifiers and the appearance snapshot that gets synchronized.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use strum::{AsRefStr, EnumIter};

/// Opaque identity of a paired user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint of a [`CharacterSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataHash(String);

impl DataHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DataHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Visual state of a character as pushed to paired peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    /// Game path -> content hash of the replacing file
    pub file_replacements: BTreeMap<String, String>,
    pub manipulation_data: String,
    /// Per-integration payloads (customization, scaling, honorifics, ...)
    pub customize_data: BTreeMap<String, String>,
}

impl CharacterSnapshot {
    /// Upper-case hex SHA-256 over the canonical JSON encoding.
    ///
    /// `BTreeMap` keeps key order stable, so equal snapshots always hash
    /// equally regardless of insertion order.
    pub fn data_hash(&self) -> DataHash {
        // Serializing plain strings and maps cannot fail.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        DataHash(hex::encode_upper(Sha256::digest(&encoded)))
    }

    pub fn file_count(&self) -> usize {
        self.file_replacements.len()
    }
}

/// Urgency of an acknowledged push. Each level has its own batch, retry queue
/// and timeout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum AckPriority {
    Low,
    Medium,
    High,
}

impl AckPriority {
    pub const ALL: [AckPriority; 3] = [AckPriority::High, AckPriority::Medium, AckPriority::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PairingStatus {
    #[default]
    Paired,
    /// Only one side added the other; nothing is exchanged.
    OneSided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserPermissions {
    pub paused: bool,
    pub disable_sounds: bool,
    pub disable_animations: bool,
    pub disable_vfx: bool,
}

impl UserPermissions {
    /// Whether data should flow to this peer at all.
    pub fn allows_sync(&self) -> bool {
        !self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(files: &[(&str, &str)]) -> CharacterSnapshot {
        CharacterSnapshot {
            file_replacements: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_insertion_order_independent() {
        let a = snapshot(&[("chara/a.mdl", "AA"), ("chara/b.tex", "BB")]);
        let b = snapshot(&[("chara/b.tex", "BB"), ("chara/a.mdl", "AA")]);
        assert_eq!(a.data_hash(), b.data_hash());
        assert_eq!(a.data_hash().as_str().len(), 64);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = snapshot(&[("chara/a.mdl", "AA")]);
        let mut b = a.clone();
        b.manipulation_data = "meta".into();
        assert_ne!(a.data_hash(), b.data_hash());
    }

    #[test]
    fn paused_peers_do_not_sync() {
        let permissions = UserPermissions {
            paused: true,
            ..Default::default()
        };
        assert!(!permissions.allows_sync());
        assert!(UserPermissions::default().allows_sync());
    }
}
