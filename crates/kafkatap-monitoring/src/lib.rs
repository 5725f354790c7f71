//! Telemetry for kafkatap: the expiring relation registry and its HTTP
//! exposition endpoint.

pub mod registry;
pub mod server;

pub use registry::{RelationRegistry, DEFAULT_EXPIRE_TIME};
pub use server::MetricsServer;
