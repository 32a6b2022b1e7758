//! The policy contract, the registry/chain resolver, and the execution
//! kernel that runs a chain against one request or response.

pub mod kernel;
pub mod registry;

use std::sync::Arc;

use serde_json::Value;

use crate::context::{
	ImmediateResponse, RequestContext, ResponseContext, UpstreamRequestModifications,
	UpstreamResponseModifications,
};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
	#[error("missing required parameter `{0}`")]
	MissingParameter(&'static str),
	#[error("invalid parameter `{name}`: {reason}")]
	InvalidParameter { name: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyExecError {
	#[error("policy failed: {0}")]
	Internal(#[from] anyhow::Error),
}

/// What a request-phase policy hook produced.
pub enum RequestOutcome {
	Continue(UpstreamRequestModifications),
	ShortCircuit(ImmediateResponse),
}

/// What a response-phase policy hook produced. Response-phase policies
/// cannot short-circuit.
pub enum ResponseOutcome {
	Continue(UpstreamResponseModifications),
}

/// The capability set a policy implements: `Validate` always, and at least
/// one of `ExecuteRequest`/`ExecuteResponse`.
pub trait Policy: Send + Sync + std::fmt::Debug {
	fn validate(&self, params: &Value) -> Result<(), ValidationError>;

	fn has_request_hook(&self) -> bool {
		false
	}

	fn has_response_hook(&self) -> bool {
		false
	}

	fn execute_request(
		&self,
		_ctx: &mut RequestContext,
		_params: &Value,
	) -> Result<RequestOutcome, PolicyExecError> {
		Ok(RequestOutcome::Continue(Default::default()))
	}

	fn execute_response(
		&self,
		_ctx: &mut ResponseContext,
		_params: &Value,
	) -> Result<ResponseOutcome, PolicyExecError> {
		Ok(ResponseOutcome::Continue(Default::default()))
	}
}

/// Produces [`Policy`] instances for a registered `(name, version)`.
pub trait PolicyFactory: Send + Sync {
	fn name(&self) -> &str;
	fn version(&self) -> u32;
	fn create(&self) -> Arc<dyn Policy>;
}

/// A configured instance within a chain.
#[derive(Debug, Clone)]
pub struct PolicySpec {
	pub name: String,
	pub version: u32,
	pub enabled: bool,
	pub parameters: Value,
	pub execution_condition: Option<String>,
}

/// An ordered list of [`PolicySpec`]s bound to a `routeKey`.
#[derive(Debug, Clone)]
pub struct RouteChain {
	pub route_key: String,
	pub specs: Vec<PolicySpec>,
}

/// A resolved chain: the specs plus the policy objects the registry
/// constructed for them, in lock-step (`specs[i]` runs via `policies[i]`).
#[derive(Clone)]
pub struct ResolvedChain {
	pub route_key: String,
	pub specs: Vec<PolicySpec>,
	pub policies: Vec<Arc<dyn Policy>>,
}

/// Per-spec outcome recorded by the kernel for observability.
#[derive(Debug, Clone)]
pub enum PolicyOutcome {
	Skipped,
	Continued,
	ShortCircuited,
	Failed(String),
}

#[derive(Debug, Clone)]
pub struct PhaseResult {
	pub route_key: String,
	pub policy_name: String,
	pub policy_version: u32,
	pub outcome: PolicyOutcome,
	pub elapsed: std::time::Duration,
}
