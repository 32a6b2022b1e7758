//! Ambient runtime plumbing shared by the policy engine binary and its tests:
//! graceful shutdown, readiness tracking, structured logging bootstrap and
//! distributed tracing export.

pub mod drain;
pub mod metrics;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod trcng;
pub mod version;
