//! `api-key` — validates a configured header against an expected value.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::context::{ImmediateResponse, RequestContext};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ValidationError};

fn deser_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(SecretString::from(String::deserialize(deserializer)?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
	#[serde(default = "default_header")]
	header: String,
	#[serde(deserialize_with = "deser_secret")]
	key: SecretString,
}

fn default_header() -> String {
	"x-api-key".to_string()
}

#[derive(Debug)]
pub struct Factory;

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"api-key"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(ApiKey)
	}
}

#[derive(Debug)]
struct ApiKey;

fn parse_params(params: &Value) -> Result<Params, ValidationError> {
	serde_json::from_value(params.clone()).map_err(|e| ValidationError::InvalidParameter {
		name: "api-key",
		reason: e.to_string(),
	})
}

impl Policy for ApiKey {
	fn validate(&self, params: &Value) -> Result<(), ValidationError> {
		parse_params(params).map(|_| ())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, ctx: &mut RequestContext, params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;

		let provided = ctx.headers.get_first(&params.header);
		let matches = provided
			.as_deref()
			.map(|v| v == params.key.expose_secret())
			.unwrap_or(false);

		if matches {
			ctx.metadata.insert("auth.success".into(), Value::Bool(true));
			ctx.metadata.insert("auth.method".into(), Value::String("api-key".into()));
			return Ok(RequestOutcome::Continue(Default::default()));
		}

		Ok(RequestOutcome::ShortCircuit(ImmediateResponse::new(
			http::StatusCode::UNAUTHORIZED,
			"unauthorized",
		)))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::context::Headers;

	fn ctx_with_header(name: &str, value: Option<&str>) -> RequestContext {
		let mut headers = Headers::new();
		if let Some(v) = value {
			headers.apply_append(name, v).unwrap();
		}
		RequestContext::new(http::Method::GET, "/".into(), headers, "r1".into())
	}

	#[test]
	fn matching_key_continues() {
		let policy = ApiKey;
		let params = json!({"header": "x-api-key", "key": "s3cr3t"});
		let mut ctx = ctx_with_header("x-api-key", Some("s3cr3t"));
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		assert!(matches!(outcome, RequestOutcome::Continue(_)));
	}

	#[test]
	fn mismatch_short_circuits_401() {
		let policy = ApiKey;
		let params = json!({"header": "x-api-key", "key": "s3cr3t"});
		let mut ctx = ctx_with_header("x-api-key", Some("wrong"));
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		match outcome {
			RequestOutcome::ShortCircuit(resp) => assert_eq!(resp.status_code, http::StatusCode::UNAUTHORIZED),
			_ => panic!("expected short circuit"),
		}
	}

	#[test]
	fn missing_header_short_circuits() {
		let policy = ApiKey;
		let params = json!({"header": "x-api-key", "key": "s3cr3t"});
		let mut ctx = ctx_with_header("x-api-key", None);
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		assert!(matches!(outcome, RequestOutcome::ShortCircuit(_)));
	}
}
