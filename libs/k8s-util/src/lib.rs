//! Transport-level helpers shared by anything that talks to a Kubernetes
//! API server: client construction with an instrumented HTTP stack, and
//! URL path templating used to keep Prometheus label cardinality bounded.

pub mod client;
pub mod metrics;
pub mod url;
