//! Core library for the multi-cluster refresh subsystem: permission-aware
//! snapshot building, streaming, manual refresh, and the representative
//! domain builders, composed per cluster by [`subsystem::ClusterSubsystem`]
//! and routed across clusters by [`aggregator::Aggregator`].

pub mod aggregator;
pub mod config;
pub mod domains;
pub mod error;
pub mod informers;
pub mod manual_queue;
pub mod metrics;
pub mod permissions;
pub mod registration;
pub mod registry;
pub mod scope;
pub mod singleflight;
pub mod snapshot;
pub mod stream;
pub mod subsystem;
pub mod telemetry;
pub mod telemetry_recorder;

pub use aggregator::Aggregator;
pub use error::{Error, Result};
pub use scope::{ClusterId, DomainCategory, DomainName, Scope};
pub use subsystem::ClusterSubsystem;
