//! Snapshot building: the builder trait/context, cache types, and the
//! service that ties them together.

pub mod builder;
pub mod service;
pub mod types;

pub use builder::{BuildContext, DomainBuilder, PlaceholderBuilder};
pub use service::SnapshotService;
pub use types::{BuildOptions, BuiltPayload, CacheEntry, PermissionMap, Snapshot, SnapshotStats};
