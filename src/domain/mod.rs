//! Domain models
//!
//! Plain data types shared between the catalog, orchestrator, executors, and
//! reconciliation engine. Database entities map into these; nothing here
//! touches sea-orm directly.

pub mod command;
pub mod journal;
pub mod mount;
pub mod node;
pub mod reconciliation;
pub mod rollup;

pub use command::{Command, CommandOutcome};
pub use journal::{JournalEntry, JournalStatus};
pub use mount::{AccessMode, BackendKind, BackendMount, MountState};
pub use node::{ConsistencyState, Node, NodeKind, NodeState};
pub use reconciliation::{
    ReconciliationJob, ReconciliationJobStatus, ReconciliationReason, ReconciliationRequest,
};
pub use rollup::{RollupDelta, RollupState, RollupSummary};
