//! Subscription filters

use super::FilestoreEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Filter applied to a subscription.
///
/// An empty filter matches everything. A populated field must match for the
/// event to be delivered: mount equality, path prefix on the payload path,
/// and membership in the event-type allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub backend_mount_id: Option<Uuid>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &FilestoreEvent) -> bool {
        if let Some(mount_id) = self.backend_mount_id {
            if event.backend_mount_id() != Some(mount_id) {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            match event.path() {
                Some(path) if path.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }
        if !self.event_types.is_empty()
            && !self.event_types.iter().any(|t| t == event.event_type())
        {
            return false;
        }
        true
    }
}
