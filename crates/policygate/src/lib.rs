pub mod app;
pub mod cel;
pub mod context;
pub mod control;
pub mod policies;
pub mod policy;
pub mod ratelimit;
pub mod telemetry;
pub mod transport;

pub use context::{
	ApiIdentity, ImmediateResponse, RequestContext, ResponseContext, UpstreamRequestModifications,
	UpstreamResponseModifications,
};
