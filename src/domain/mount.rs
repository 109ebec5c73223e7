//! Backend mount - identity of a storage root

use crate::shared::error::{FilestoreError, FilestoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Storage backend flavor behind a mount
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
}

/// Whether commands may mutate the mount
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessMode {
    Rw,
    Ro,
}

/// Operational lifecycle of a mount
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MountState {
    Active,
    Offline,
    Degraded,
    Unknown,
}

/// A named storage root with kind-specific configuration.
///
/// Exactly one of `root_path` (local) or `bucket` (s3) is populated; the
/// catalog rejects rows that violate this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendMount {
    pub id: Uuid,
    pub mount_key: String,
    pub backend_kind: BackendKind,
    pub access_mode: AccessMode,
    pub state: MountState,
    pub root_path: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackendMount {
    pub fn is_writable(&self) -> bool {
        matches!(self.access_mode, AccessMode::Rw)
    }

    /// Validate the kind/config pairing invariant
    pub fn validate(&self) -> FilestoreResult<()> {
        match self.backend_kind {
            BackendKind::Local => {
                if self.root_path.is_none() || self.bucket.is_some() {
                    return Err(FilestoreError::invalid_request(format!(
                        "local mount '{}' must set rootPath and nothing else",
                        self.mount_key
                    )));
                }
            }
            BackendKind::S3 => {
                if self.bucket.is_none() || self.root_path.is_some() {
                    return Err(FilestoreError::invalid_request(format!(
                        "s3 mount '{}' must set bucket and not rootPath",
                        self.mount_key
                    )));
                }
            }
        }
        Ok(())
    }
}
