//! Per-directory aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Freshness of a rollup row
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RollupState {
    UpToDate,
    Pending,
    Stale,
    Invalid,
}

/// Aggregate of a directory's descendants.
///
/// File rollups always report zero counts; deleted nodes report `invalid`
/// with zeroed values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupSummary {
    pub node_id: Uuid,
    pub size_bytes: i64,
    pub file_count: i64,
    pub directory_count: i64,
    pub child_count: i64,
    pub pending_bytes_delta: i64,
    pub pending_items_delta: i64,
    pub state: RollupState,
    pub last_calculated_at: Option<DateTime<Utc>>,
}

impl RollupSummary {
    /// Empty up-to-date rollup for a freshly inserted node
    pub fn empty(node_id: Uuid) -> Self {
        Self {
            node_id,
            size_bytes: 0,
            file_count: 0,
            directory_count: 0,
            child_count: 0,
            pending_bytes_delta: 0,
            pending_items_delta: 0,
            state: RollupState::UpToDate,
            last_calculated_at: None,
        }
    }

    /// Zeroed invalid rollup for a deleted node
    pub fn invalidated(node_id: Uuid) -> Self {
        Self {
            state: RollupState::Invalid,
            ..Self::empty(node_id)
        }
    }
}

/// Signed change to a directory's aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupDelta {
    pub size_bytes: i64,
    pub file_count: i64,
    pub directory_count: i64,
    pub child_count: i64,
}

impl RollupDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn inverted(&self) -> Self {
        Self {
            size_bytes: -self.size_bytes,
            file_count: -self.file_count,
            directory_count: -self.directory_count,
            child_count: -self.child_count,
        }
    }

    /// Projection applied to ancestors above the immediate parent: size and
    /// directory totals are recursive, file and child counts are not.
    pub fn for_ancestors(&self) -> Self {
        Self {
            size_bytes: self.size_bytes,
            file_count: 0,
            directory_count: self.directory_count,
            child_count: 0,
        }
    }

    /// Items moved, as accumulated on pending rollups
    pub fn item_count(&self) -> i64 {
        self.file_count + self.directory_count + self.child_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_projection_drops_direct_counts() {
        let delta = RollupDelta {
            size_bytes: 42,
            file_count: 1,
            directory_count: 2,
            child_count: 1,
        };
        let up = delta.for_ancestors();
        assert_eq!(up.size_bytes, 42);
        assert_eq!(up.directory_count, 2);
        assert_eq!(up.file_count, 0);
        assert_eq!(up.child_count, 0);
    }

    #[test]
    fn inversion_round_trips() {
        let delta = RollupDelta {
            size_bytes: 7,
            file_count: 1,
            directory_count: 0,
            child_count: 1,
        };
        assert_eq!(delta.inverted().inverted(), delta);
        assert!(RollupDelta::default().is_zero());
    }
}
