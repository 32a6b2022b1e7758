//! `body-to-uppercase` — rewrites the request body to upper case. Requires
//! the buffered request body to be available by the time the request phase
//! runs.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::context::{RequestContext, UpstreamRequestModifications};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ValidationError};

#[derive(Debug)]
pub struct Factory;

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"body-to-uppercase"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(UppercaseBody)
	}
}

#[derive(Debug)]
struct UppercaseBody;

impl Policy for UppercaseBody {
	fn validate(&self, _params: &Value) -> Result<(), ValidationError> {
		Ok(())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, ctx: &mut RequestContext, _params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		if !ctx.body.present {
			return Ok(RequestOutcome::Continue(Default::default()));
		}
		let upper = ctx.body.content.to_ascii_uppercase();
		Ok(RequestOutcome::Continue(UpstreamRequestModifications {
			body: Some(Bytes::from(upper)),
			..Default::default()
		}))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::context::Headers;

	#[test]
	fn uppercases_a_buffered_body() {
		let policy = UppercaseBody;
		let mut ctx = RequestContext::new(http::Method::POST, "/".into(), Headers::new(), "r1".into());
		ctx.body.replace(Bytes::from_static(b"hello world"));
		let outcome = policy.execute_request(&mut ctx, &json!({})).unwrap();
		match outcome {
			RequestOutcome::Continue(m) => assert_eq!(m.body.unwrap(), Bytes::from_static(b"HELLO WORLD")),
			_ => panic!("expected continue"),
		}
	}

	#[test]
	fn no_body_is_a_no_op() {
		let policy = UppercaseBody;
		let mut ctx = RequestContext::new(http::Method::GET, "/".into(), Headers::new(), "r1".into());
		let outcome = policy.execute_request(&mut ctx, &json!({})).unwrap();
		match outcome {
			RequestOutcome::Continue(m) => assert!(m.body.is_none()),
			_ => panic!("expected continue"),
		}
	}
}
