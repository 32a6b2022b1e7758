//! Runs a resolved chain against one request or response.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use crate::cel;
use crate::context::{MutationError, RequestContext, ResponseContext};
use crate::policy::{PhaseResult, PolicyExecError, PolicyOutcome, RequestOutcome, ResolvedChain, ResponseOutcome};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("execution condition `{expr}` for policy `{policy}` failed to evaluate: {source}")]
	Condition {
		policy: String,
		expr: String,
		#[source]
		source: cel::Error,
	},
	#[error("policy `{policy}` failed: {source}")]
	PolicyFatal {
		policy: String,
		#[source]
		source: crate::policy::PolicyExecError,
		/// Results for the policies that ran before the failure, including a
		/// [`PolicyOutcome::Failed`] entry for the policy that caused it, so a
		/// caller can still emit an observability record for the whole chain.
		results: Vec<PhaseResult>,
	},
	#[error("policy `{policy}` produced an invalid mutation: {source}")]
	Mutation {
		policy: String,
		#[source]
		source: MutationError,
	},
}

/// Recovers the payload of a caught policy panic as a display string.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"policy panicked with a non-string payload".to_string()
	}
}

/// Outcome of running one phase of a chain.
pub struct PhaseRun<T> {
	pub results: Vec<PhaseResult>,
	pub short_circuited: bool,
	pub final_action: Option<T>,
}

/// Runs chains against the contexts the transport adapter builds, folding
/// policy mutations back into them step by step.
pub struct Kernel {
	cel: std::sync::Arc<cel::Evaluator>,
}

impl Kernel {
	pub fn new(cel: std::sync::Arc<cel::Evaluator>) -> Self {
		Self { cel }
	}

	/// Runs the request phase. On `Ok` with `short_circuited == true`,
	/// `final_action` holds the short-circuit response and the response
	/// phase must not run for this exchange.
	pub fn execute_request_phase(
		&self,
		chain: &ResolvedChain,
		ctx: &mut RequestContext,
	) -> Result<PhaseRun<crate::context::ImmediateResponse>, Error> {
		let mut results = Vec::with_capacity(chain.specs.len());
		let mut short_circuited = false;
		let mut final_action = None;

		for (spec, policy) in chain.specs.iter().zip(chain.policies.iter()) {
			let started = Instant::now();

			if !spec.enabled {
				results.push(skipped(chain, spec, started));
				continue;
			}

			if let Some(expr) = &spec.execution_condition {
				match self.cel.evaluate_condition_request(expr, ctx) {
					Ok(true) => {},
					Ok(false) => {
						results.push(skipped(chain, spec, started));
						continue;
					},
					Err(source) => {
						return Err(Error::Condition {
							policy: spec.name.clone(),
							expr: expr.clone(),
							source,
						});
					},
				}
			}

			match catch_unwind(AssertUnwindSafe(|| policy.execute_request(ctx, &spec.parameters))) {
				Ok(Ok(RequestOutcome::Continue(modifications))) => {
					modifications.fold_into(ctx).map_err(|source| Error::Mutation {
						policy: spec.name.clone(),
						source,
					})?;
					results.push(continued(chain, spec, started));
				},
				Ok(Ok(RequestOutcome::ShortCircuit(response))) => {
					results.push(short_circuit_result(chain, spec, started));
					short_circuited = true;
					final_action = Some(response);
					break;
				},
				Ok(Err(source)) => {
					results.push(failed(chain, spec, source.to_string(), started));
					return Err(Error::PolicyFatal {
						policy: spec.name.clone(),
						source,
						results,
					});
				},
				Err(panic) => {
					let message = panic_message(&*panic);
					results.push(failed(chain, spec, message.clone(), started));
					return Err(Error::PolicyFatal {
						policy: spec.name.clone(),
						source: PolicyExecError::Internal(anyhow::anyhow!("policy panicked: {message}")),
						results,
					});
				},
			}
		}

		Ok(PhaseRun {
			results,
			short_circuited,
			final_action,
		})
	}

	/// Runs the response phase. Response-phase policies cannot short-circuit;
	/// only policies advertising a response hook are invoked.
	pub fn execute_response_phase(
		&self,
		chain: &ResolvedChain,
		ctx: &mut ResponseContext,
	) -> Result<PhaseRun<std::convert::Infallible>, Error> {
		let mut results = Vec::with_capacity(chain.specs.len());

		for (spec, policy) in chain.specs.iter().zip(chain.policies.iter()) {
			let started = Instant::now();

			if !spec.enabled || !policy.has_response_hook() {
				results.push(skipped(chain, spec, started));
				continue;
			}

			if let Some(expr) = &spec.execution_condition {
				match self.cel.evaluate_condition_response(expr, ctx) {
					Ok(true) => {},
					Ok(false) => {
						results.push(skipped(chain, spec, started));
						continue;
					},
					Err(source) => {
						return Err(Error::Condition {
							policy: spec.name.clone(),
							expr: expr.clone(),
							source,
						});
					},
				}
			}

			match catch_unwind(AssertUnwindSafe(|| policy.execute_response(ctx, &spec.parameters))) {
				Ok(Ok(ResponseOutcome::Continue(modifications))) => {
					modifications.fold_into(ctx).map_err(|source| Error::Mutation {
						policy: spec.name.clone(),
						source,
					})?;
					results.push(continued(chain, spec, started));
				},
				Ok(Err(source)) => {
					results.push(failed(chain, spec, source.to_string(), started));
					return Err(Error::PolicyFatal {
						policy: spec.name.clone(),
						source,
						results,
					});
				},
				Err(panic) => {
					let message = panic_message(&*panic);
					results.push(failed(chain, spec, message.clone(), started));
					return Err(Error::PolicyFatal {
						policy: spec.name.clone(),
						source: PolicyExecError::Internal(anyhow::anyhow!("policy panicked: {message}")),
						results,
					});
				},
			}
		}

		Ok(PhaseRun {
			results,
			short_circuited: false,
			final_action: None,
		})
	}
}

fn skipped(chain: &ResolvedChain, spec: &crate::policy::PolicySpec, started: Instant) -> PhaseResult {
	result(chain, spec, PolicyOutcome::Skipped, started)
}

fn continued(chain: &ResolvedChain, spec: &crate::policy::PolicySpec, started: Instant) -> PhaseResult {
	result(chain, spec, PolicyOutcome::Continued, started)
}

fn short_circuit_result(chain: &ResolvedChain, spec: &crate::policy::PolicySpec, started: Instant) -> PhaseResult {
	result(chain, spec, PolicyOutcome::ShortCircuited, started)
}

fn failed(chain: &ResolvedChain, spec: &crate::policy::PolicySpec, message: String, started: Instant) -> PhaseResult {
	result(chain, spec, PolicyOutcome::Failed(message), started)
}

fn result(chain: &ResolvedChain, spec: &crate::policy::PolicySpec, outcome: PolicyOutcome, started: Instant) -> PhaseResult {
	PhaseResult {
		route_key: chain.route_key.clone(),
		policy_name: spec.name.clone(),
		policy_version: spec.version,
		outcome,
		elapsed: started.elapsed(),
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use http::Method;
	use serde_json::{json, Value};

	use super::*;
	use crate::context::{Headers, HeaderAction, HeaderEdit, ImmediateResponse, UpstreamRequestModifications};
	use crate::policy::{Policy, PolicyExecError, PolicyFactory, PolicySpec, ValidationError};

	#[derive(Debug)]
	struct SetHeaderPolicy;
	impl Policy for SetHeaderPolicy {
		fn validate(&self, _params: &Value) -> Result<(), ValidationError> {
			Ok(())
		}
		fn has_request_hook(&self) -> bool {
			true
		}
		fn execute_request(
			&self,
			_ctx: &mut RequestContext,
			_params: &Value,
		) -> Result<RequestOutcome, PolicyExecError> {
			Ok(RequestOutcome::Continue(UpstreamRequestModifications {
				header_edits: vec![HeaderEdit {
					action: HeaderAction::Set,
					name: "x-seen".into(),
					value: Some("yes".into()),
				}],
				..Default::default()
			}))
		}
	}

	#[derive(Debug)]
	struct RespondPolicy;
	impl Policy for RespondPolicy {
		fn validate(&self, _params: &Value) -> Result<(), ValidationError> {
			Ok(())
		}
		fn has_request_hook(&self) -> bool {
			true
		}
		fn execute_request(
			&self,
			_ctx: &mut RequestContext,
			_params: &Value,
		) -> Result<RequestOutcome, PolicyExecError> {
			Ok(RequestOutcome::ShortCircuit(ImmediateResponse::new(
				http::StatusCode::FORBIDDEN,
				"no",
			)))
		}
	}

	fn spec(name: &str, condition: Option<&str>) -> PolicySpec {
		PolicySpec {
			name: name.into(),
			version: 1,
			enabled: true,
			parameters: json!({}),
			execution_condition: condition.map(str::to_string),
		}
	}

	fn chain_of(policies: Vec<(&str, Arc<dyn Policy>)>) -> ResolvedChain {
		let specs = policies.iter().map(|(name, _)| spec(name, None)).collect();
		let policies = policies.into_iter().map(|(_, p)| p).collect();
		ResolvedChain {
			route_key: "r1".into(),
			specs,
			policies,
		}
	}

	fn ctx() -> RequestContext {
		RequestContext::new(Method::GET, "/x".into(), Headers::new(), "r1".into())
	}

	#[test]
	fn continue_outcome_folds_mutation_into_context() {
		let kernel = Kernel::new(Arc::new(cel::Evaluator::new()));
		let chain = chain_of(vec![("set-header", Arc::new(SetHeaderPolicy))]);
		let mut c = ctx();
		let run = kernel.execute_request_phase(&chain, &mut c).unwrap();
		assert!(!run.short_circuited);
		assert_eq!(c.headers.get_first("x-seen"), Some("yes".to_string()));
		assert!(matches!(run.results[0].outcome, PolicyOutcome::Continued));
	}

	#[test]
	fn short_circuit_stops_the_chain() {
		let kernel = Kernel::new(Arc::new(cel::Evaluator::new()));
		let chain = chain_of(vec![
			("respond", Arc::new(RespondPolicy)),
			("set-header", Arc::new(SetHeaderPolicy)),
		]);
		let mut c = ctx();
		let run = kernel.execute_request_phase(&chain, &mut c).unwrap();
		assert!(run.short_circuited);
		assert_eq!(run.results.len(), 1, "second policy must not run");
		assert_eq!(run.final_action.unwrap().status_code, http::StatusCode::FORBIDDEN);
		assert_eq!(c.headers.get_first("x-seen"), None);
	}

	#[test]
	fn disabled_spec_is_skipped() {
		let kernel = Kernel::new(Arc::new(cel::Evaluator::new()));
		let mut chain = chain_of(vec![("set-header", Arc::new(SetHeaderPolicy))]);
		chain.specs[0].enabled = false;
		let mut c = ctx();
		let run = kernel.execute_request_phase(&chain, &mut c).unwrap();
		assert!(matches!(run.results[0].outcome, PolicyOutcome::Skipped));
		assert_eq!(c.headers.get_first("x-seen"), None);
	}

	#[test]
	fn false_condition_skips_without_running_policy() {
		let kernel = Kernel::new(Arc::new(cel::Evaluator::new()));
		let mut chain = chain_of(vec![("set-header", Arc::new(SetHeaderPolicy))]);
		chain.specs[0].execution_condition = Some("1 == 2".to_string());
		let mut c = ctx();
		let run = kernel.execute_request_phase(&chain, &mut c).unwrap();
		assert!(matches!(run.results[0].outcome, PolicyOutcome::Skipped));
	}

	#[test]
	fn condition_evaluation_error_aborts_the_chain() {
		let kernel = Kernel::new(Arc::new(cel::Evaluator::new()));
		let mut chain = chain_of(vec![("set-header", Arc::new(SetHeaderPolicy))]);
		chain.specs[0].execution_condition = Some("request.nope.missing".to_string());
		let mut c = ctx();
		let err = kernel.execute_request_phase(&chain, &mut c).unwrap_err();
		assert!(matches!(err, Error::Condition { .. }));
	}
}
