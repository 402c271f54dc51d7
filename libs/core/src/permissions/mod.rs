//! Permission descriptors, their cache entries, and the checker that ties
//! them to live SSAR probing.

pub mod cache;
pub mod checker;
pub mod descriptor;

pub use cache::{DecisionSource, EntryState, PermissionDecision};
pub use checker::{chunk_descriptors, PermissionChecker};
pub use descriptor::PermissionDescriptor;
