//! Sea-ORM entity definitions
//!
//! These map catalog rows to database tables; the catalog layer converts
//! them into the domain models.

pub mod backend_mount;
pub mod journal_entry;
pub mod node;
pub mod reconciliation_job;
pub mod rollup;
pub mod snapshot;

// Re-export all entities
pub use backend_mount::Entity as BackendMount;
pub use journal_entry::Entity as JournalEntry;
pub use node::Entity as NodeRow;
pub use reconciliation_job::Entity as ReconciliationJob;
pub use rollup::Entity as Rollup;
pub use snapshot::Entity as Snapshot;

// Re-export active models for easy access
pub use backend_mount::ActiveModel as BackendMountActive;
pub use journal_entry::ActiveModel as JournalEntryActive;
pub use node::ActiveModel as NodeRowActive;
pub use reconciliation_job::ActiveModel as ReconciliationJobActive;
pub use rollup::ActiveModel as RollupActive;
pub use snapshot::ActiveModel as SnapshotActive;
