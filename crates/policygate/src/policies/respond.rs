//! `respond` — always short-circuits with a configured response.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::context::{ImmediateResponse, RequestContext};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ValidationError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
	#[serde(default = "default_status")]
	status_code: u16,
	#[serde(default)]
	body: String,
	#[serde(default)]
	headers: Vec<(String, String)>,
}

fn default_status() -> u16 {
	200
}

#[derive(Debug)]
pub struct Factory;

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"respond"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(Respond)
	}
}

#[derive(Debug)]
struct Respond;

fn parse_params(params: &Value) -> Result<Params, ValidationError> {
	let parsed: Params = serde_json::from_value(params.clone()).map_err(|e| ValidationError::InvalidParameter {
		name: "respond",
		reason: e.to_string(),
	})?;
	if !(100..=599).contains(&parsed.status_code) {
		return Err(ValidationError::InvalidParameter {
			name: "statusCode",
			reason: format!("{} is outside 100-599", parsed.status_code),
		});
	}
	Ok(parsed)
}

impl Policy for Respond {
	fn validate(&self, params: &Value) -> Result<(), ValidationError> {
		parse_params(params).map(|_| ())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, _ctx: &mut RequestContext, params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;
		let status = http::StatusCode::from_u16(params.status_code).map_err(|e| PolicyExecError::Internal(e.into()))?;

		let mut response = ImmediateResponse::new(status, Bytes::from(params.body));
		for (name, value) in params.headers {
			response = response.with_header(name, value);
		}
		Ok(RequestOutcome::ShortCircuit(response))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn ctx() -> RequestContext {
		RequestContext::new(
			http::Method::GET,
			"/".into(),
			crate::context::Headers::new(),
			"r1".into(),
		)
	}

	#[test]
	fn default_status_is_200() {
		let policy = Respond;
		let outcome = policy.execute_request(&mut ctx(), &json!({})).unwrap();
		match outcome {
			RequestOutcome::ShortCircuit(resp) => assert_eq!(resp.status_code, http::StatusCode::OK),
			_ => panic!("expected short circuit"),
		}
	}

	#[test]
	fn header_names_are_lowercased() {
		let policy = Respond;
		let params = json!({"headers": [["X-Custom", "v"]]});
		let outcome = policy.execute_request(&mut ctx(), &params).unwrap();
		match outcome {
			RequestOutcome::ShortCircuit(resp) => assert_eq!(resp.headers, vec![("x-custom".to_string(), "v".to_string())]),
			_ => panic!("expected short circuit"),
		}
	}

	#[test]
	fn out_of_range_status_rejected_at_validate() {
		let policy = Respond;
		assert!(policy.validate(&json!({"statusCode": 999})).is_err());
	}
}
