//! Member types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Numeric member identifier, unique within the grid
pub type MemberId = u32;

/// Whether a member participates in partition storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    /// Holds primary and backup copies
    #[default]
    StorageEnabled,
    /// Routes requests only, never owns partitions
    StorageDisabled,
}

impl MemberRole {
    pub fn is_storage_enabled(&self) -> bool {
        matches!(self, MemberRole::StorageEnabled)
    }
}

/// Information a member announces when it joins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    /// Unique member identifier
    pub id: MemberId,

    /// Human-readable name
    pub name: Option<String>,

    /// Storage participation
    pub role: MemberRole,

    /// Member version (for compatibility checking)
    pub version: String,

    /// Custom metadata/tags
    pub tags: HashMap<String, String>,
}

impl MemberInfo {
    /// Create new member info for a storage-enabled member
    pub fn new(id: MemberId) -> Self {
        Self {
            id,
            name: None,
            role: MemberRole::StorageEnabled,
            version: env!("CARGO_PKG_VERSION").to_string(),
            tags: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_role(mut self, role: MemberRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Display name, falling back to the numeric id
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("member-{}", self.id))
    }
}

/// A live member as seen by a membership view
#[derive(Debug, Clone)]
pub struct Member {
    /// Announced information
    pub info: MemberInfo,

    /// Join order stamp; lower means joined earlier
    pub incarnation: u64,

    /// Sequence number of the join event
    pub joined_seq: u64,

    /// Local time the join was observed
    pub joined_at: Instant,
}

impl Member {
    pub fn new(info: MemberInfo, incarnation: u64, joined_seq: u64) -> Self {
        Self {
            info,
            incarnation,
            joined_seq,
            joined_at: Instant::now(),
        }
    }

    pub fn id(&self) -> MemberId {
        self.info.id
    }

    pub fn is_storage_enabled(&self) -> bool {
        self.info.role.is_storage_enabled()
    }

    /// Seniority ordering key: earliest join wins, id breaks ties
    pub fn seniority(&self) -> (u64, MemberId) {
        (self.incarnation, self.info.id)
    }
}
