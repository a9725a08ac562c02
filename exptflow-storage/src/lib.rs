//! exptflow Storage - Storage Traits and Mock Implementation
//!
//! Defines the storage abstraction consumed by the engine: row repositories,
//! TTL leases, idempotency markers and the deadline due store. Production
//! backends implement these traits outside this workspace.

pub mod deadline;
pub mod idempotency;
pub mod lease;
pub mod memory;
pub mod repo;

pub use deadline::{DeadlineStore, InMemoryDeadlineStore};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
pub use lease::{InMemoryLeaseStore, LeaseStore};
pub use memory::MockStorage;
pub use repo::{ExptStorage, PageResult};
