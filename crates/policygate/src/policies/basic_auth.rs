//! `basic-auth` — validates an `Authorization: Basic` header against a
//! configured username/password.

use std::sync::Arc;

use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn deser_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(SecretString::from(String::deserialize(deserializer)?))
}

use crate::context::{ImmediateResponse, RequestContext};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ValidationError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
	username: String,
	#[serde(deserialize_with = "deser_secret")]
	password: SecretString,
	#[serde(default)]
	allow_unauthenticated: bool,
	#[serde(default = "default_realm")]
	realm: String,
}

fn default_realm() -> String {
	"policygate".to_string()
}

#[derive(Debug)]
pub struct Factory;

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"basic-auth"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(BasicAuth)
	}
}

#[derive(Debug)]
struct BasicAuth;

fn parse_params(params: &Value) -> Result<Params, ValidationError> {
	serde_json::from_value(params.clone()).map_err(|e| ValidationError::InvalidParameter {
		name: "basic-auth",
		reason: e.to_string(),
	})
}

/// Byte-length-leaking-free-ish equality: always walks both slices to
/// completion before returning, so a timing side channel cannot reveal how
/// many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

fn decode_credentials(header: &str) -> Option<(String, String)> {
	let encoded = header.strip_prefix("Basic ")?;
	let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let (user, pass) = decoded.split_once(':')?;
	Some((user.to_string(), pass.to_string()))
}

impl Policy for BasicAuth {
	fn validate(&self, params: &Value) -> Result<(), ValidationError> {
		parse_params(params).map(|_| ())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, ctx: &mut RequestContext, params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;

		let provided = ctx.headers.get_first("authorization").and_then(|h| decode_credentials(&h));

		let authenticated = match &provided {
			Some((user, pass)) => {
				constant_time_eq(user.as_bytes(), params.username.as_bytes())
					&& constant_time_eq(pass.as_bytes(), params.password.expose_secret().as_bytes())
			},
			None => false,
		};

		if authenticated {
			ctx.metadata.insert("auth.success".into(), Value::Bool(true));
			ctx.metadata.insert(
				"auth.username".into(),
				Value::String(provided.expect("authenticated implies provided").0),
			);
			ctx.metadata.insert("auth.method".into(), Value::String("basic".into()));
			return Ok(RequestOutcome::Continue(Default::default()));
		}

		if params.allow_unauthenticated {
			ctx.metadata.insert("auth.success".into(), Value::Bool(false));
			return Ok(RequestOutcome::Continue(Default::default()));
		}

		Ok(RequestOutcome::ShortCircuit(
			ImmediateResponse::new(http::StatusCode::UNAUTHORIZED, "unauthorized")
				.with_header("www-authenticate", format!("Basic realm=\"{}\"", params.realm)),
		))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::context::Headers;

	fn ctx_with_auth(header: Option<&str>) -> RequestContext {
		let mut headers = Headers::new();
		if let Some(h) = header {
			headers.apply_append("authorization", h).unwrap();
		}
		RequestContext::new(http::Method::GET, "/".into(), headers, "r1".into())
	}

	fn encode(user: &str, pass: &str) -> String {
		format!(
			"Basic {}",
			base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
		)
	}

	#[test]
	fn valid_credentials_continue_with_metadata() {
		let policy = BasicAuth;
		let params = json!({"username": "alice", "password": "secret"});
		let mut ctx = ctx_with_auth(Some(&encode("alice", "secret")));
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		assert!(matches!(outcome, RequestOutcome::Continue(_)));
		assert_eq!(ctx.metadata["auth.success"], json!(true));
		assert_eq!(ctx.metadata["auth.username"], json!("alice"));
	}

	#[test]
	fn wrong_password_short_circuits_401() {
		let policy = BasicAuth;
		let params = json!({"username": "alice", "password": "secret"});
		let mut ctx = ctx_with_auth(Some(&encode("alice", "wrong")));
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		match outcome {
			RequestOutcome::ShortCircuit(resp) => assert_eq!(resp.status_code, http::StatusCode::UNAUTHORIZED),
			_ => panic!("expected short circuit"),
		}
	}

	#[test]
	fn missing_header_allowed_when_configured() {
		let policy = BasicAuth;
		let params = json!({"username": "alice", "password": "secret", "allowUnauthenticated": true});
		let mut ctx = ctx_with_auth(None);
		let outcome = policy.execute_request(&mut ctx, &params).unwrap();
		assert!(matches!(outcome, RequestOutcome::Continue(_)));
		assert_eq!(ctx.metadata["auth.success"], json!(false));
	}

	#[test]
	fn validate_rejects_missing_fields() {
		let policy = BasicAuth;
		assert!(policy.validate(&json!({"username": "alice"})).is_err());
	}
}
