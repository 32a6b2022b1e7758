//! The `rate-limit` built-in policy: distributed GCRA quota enforcement
//! against a shared counter store.

pub mod cost;
pub mod gcra;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::cel;
use crate::context::{ImmediateResponse, RequestContext, ResponseContext};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ResponseOutcome, ValidationError};
use crate::ratelimit::cost::CostSource;
use crate::ratelimit::store::RateLimitStore;

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Params {
	rate: u64,
	#[serde(default = "default_period_ns")]
	period_ns: i64,
	#[serde(default)]
	burst: u64,
	key_expression: Option<String>,
	#[serde(default)]
	cost_extraction: Vec<CostSource>,
	#[serde(default = "default_cost")]
	default_cost: u64,
	#[serde(default)]
	fail_open: bool,
}

fn default_period_ns() -> i64 {
	1_000_000_000
}

fn default_cost() -> u64 {
	1
}

fn parse_params(params: &Value) -> Result<Params, ValidationError> {
	let parsed: Params = serde_json::from_value(params.clone()).map_err(|e| ValidationError::InvalidParameter {
		name: "rate-limit",
		reason: e.to_string(),
	})?;
	if parsed.rate == 0 {
		return Err(ValidationError::InvalidParameter {
			name: "rate",
			reason: "must be >= 1".to_string(),
		});
	}
	if parsed.default_cost == 0 {
		return Err(ValidationError::InvalidParameter {
			name: "defaultCost",
			reason: "must be >= 1".to_string(),
		});
	}
	Ok(parsed)
}

fn now_ns() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos() as i64
}

fn default_key(req: &RequestContext) -> String {
	format!(
		"{}:{}:{}:{}",
		req.route_name, req.api.api_id, req.api.api_name, req.api.api_version
	)
}

pub struct Factory {
	store: Arc<dyn RateLimitStore>,
	cel: Arc<cel::Evaluator>,
}

impl std::fmt::Debug for Factory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ratelimit::Factory").finish()
	}
}

impl Factory {
	pub fn new(store: Arc<dyn RateLimitStore>, cel: Arc<cel::Evaluator>) -> Self {
		Self { store, cel }
	}
}

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"rate-limit"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(RateLimit {
			store: self.store.clone(),
			cel: self.cel.clone(),
		})
	}
}

#[derive(Debug)]
struct RateLimit {
	store: Arc<dyn RateLimitStore>,
	cel: Arc<cel::Evaluator>,
}

fn gcra_params(params: &Params) -> gcra::Params {
	gcra::Params::new(params.rate, params.period_ns, params.burst)
}

fn deny_response(decision: gcra::Decision) -> ImmediateResponse {
	let retry_after_s = (decision.retry_after_ns as f64 / 1_000_000_000.0).ceil() as i64;
	ImmediateResponse::new(
		http::StatusCode::TOO_MANY_REQUESTS,
		json!({
			"error": "rate limit exceeded",
			"remaining": decision.remaining,
			"retryAfterSeconds": retry_after_s,
		})
		.to_string(),
	)
	.with_header("retry-after", retry_after_s.to_string())
	.with_header("content-type", "application/json")
}

impl Policy for RateLimit {
	fn validate(&self, params: &Value) -> Result<(), ValidationError> {
		parse_params(params).map(|_| ())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn has_response_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, ctx: &mut RequestContext, params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;
		let key = match &params.key_expression {
			Some(expr) => self
				.cel
				.evaluate_key(expr, ctx)
				.map_err(|e| PolicyExecError::Internal(e.into()))?,
			None => default_key(ctx),
		};

		let cost = cost::extract_request_cost(&params.cost_extraction, &self.cel, ctx)
			.map(|c| c.max(0.0).round() as i64)
			.unwrap_or(params.default_cost as i64);

		let gp = gcra_params(&params);
		let now = now_ns();
		let store = self.store.clone();
		let decision = futures::executor::block_on(store.get_and_update(
			&key,
			now,
			&move |tat| {
				let d = gcra::step(tat, now, cost, gp);
				d.allowed.then_some(d.reset_ns)
			},
			Duration::from_secs(gp.ttl_s),
		));

		let decision = match decision {
			Ok(tat) => gcra::step(tat, now, cost, gp),
			Err(_) if params.fail_open => {
				return Ok(RequestOutcome::Continue(Default::default()));
			},
			Err(source) => return Err(PolicyExecError::Internal(source.into())),
		};

		ctx.metadata.insert("ratelimit.key".into(), Value::String(key));
		if decision.allowed {
			Ok(RequestOutcome::Continue(Default::default()))
		} else {
			Ok(RequestOutcome::ShortCircuit(deny_response(decision)))
		}
	}

	fn execute_response(&self, resp: &mut ResponseContext, params: &Value) -> Result<ResponseOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;
		let response_side = params
			.cost_extraction
			.iter()
			.any(|s| matches!(s, CostSource::ResponseHeader { .. } | CostSource::ResponseBody { .. } | CostSource::ResponseCel { .. }));
		if !response_side {
			return Ok(ResponseOutcome::Continue(Default::default()));
		}

		let Some(extracted) = cost::extract_response_cost(&params.cost_extraction, &self.cel, resp) else {
			return Ok(ResponseOutcome::Continue(Default::default()));
		};

		let key = match &params.key_expression {
			Some(expr) => self
				.cel
				.evaluate_key(expr, &resp.request)
				.map_err(|e| PolicyExecError::Internal(e.into()))?,
			None => default_key(&resp.request),
		};
		// Already charged 1 on the request phase; charge the delta only.
		let delta = extracted.round() as i64 - 1;
		if delta == 0 {
			return Ok(ResponseOutcome::Continue(Default::default()));
		}

		let gp = gcra_params(&params);
		let now = now_ns();
		let _ = futures::executor::block_on(self.store.get_and_update(
			&key,
			now,
			&move |tat| {
				let d = gcra::step(tat, now, delta.max(0), gp);
				d.allowed.then_some(d.reset_ns)
			},
			Duration::from_secs(gp.ttl_s),
		));

		Ok(ResponseOutcome::Continue(Default::default()))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::context::Headers;

	fn ctx() -> RequestContext {
		RequestContext::new(http::Method::GET, "/".into(), Headers::new(), "r1".into())
	}

	#[test]
	fn accepts_within_burst_then_denies() {
		let store: Arc<dyn RateLimitStore> = Arc::new(store::InMemoryStore::new());
		let cel = Arc::new(cel::Evaluator::new());
		let policy = RateLimit {
			store: store.clone(),
			cel,
		};
		let params = json!({"rate": 1, "periodNs": 1_000_000_000i64, "burst": 0});

		let first = policy.execute_request(&mut ctx(), &params).unwrap();
		assert!(matches!(first, RequestOutcome::Continue(_)));

		let second = policy.execute_request(&mut ctx(), &params).unwrap();
		match second {
			RequestOutcome::ShortCircuit(resp) => assert_eq!(resp.status_code, http::StatusCode::TOO_MANY_REQUESTS),
			_ => panic!("expected the second immediate request to be denied"),
		}
	}

	#[test]
	fn validate_rejects_zero_rate() {
		let policy = RateLimit {
			store: Arc::new(store::InMemoryStore::new()),
			cel: Arc::new(cel::Evaluator::new()),
		};
		assert!(policy.validate(&json!({"rate": 0})).is_err());
	}
}
