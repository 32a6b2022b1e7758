//! `modify-headers` — applies a configured, ordered list of header edits to
//! the request and/or response.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::context::{
	HeaderAction, HeaderEdit, RequestContext, ResponseContext, UpstreamRequestModifications,
	UpstreamResponseModifications,
};
use crate::policy::{Policy, PolicyExecError, PolicyFactory, RequestOutcome, ResponseOutcome, ValidationError};

#[derive(Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum Action {
	Set,
	Append,
	Delete,
}

impl From<Action> for HeaderAction {
	fn from(a: Action) -> Self {
		match a {
			Action::Set => HeaderAction::Set,
			Action::Append => HeaderAction::Append,
			Action::Delete => HeaderAction::Delete,
		}
	}
}

#[derive(Deserialize)]
struct RawEdit {
	action: Action,
	name: String,
	#[serde(default)]
	value: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Params {
	#[serde(default)]
	request_headers: Vec<RawEdit>,
	#[serde(default)]
	response_headers: Vec<RawEdit>,
}

#[derive(Debug)]
pub struct Factory;

impl PolicyFactory for Factory {
	fn name(&self) -> &str {
		"modify-headers"
	}
	fn version(&self) -> u32 {
		1
	}
	fn create(&self) -> Arc<dyn Policy> {
		Arc::new(ModifyHeaders)
	}
}

#[derive(Debug)]
struct ModifyHeaders;

fn parse_params(params: &Value) -> Result<Params, ValidationError> {
	let parsed: Params = serde_json::from_value(params.clone()).map_err(|e| ValidationError::InvalidParameter {
		name: "modify-headers",
		reason: e.to_string(),
	})?;
	if parsed.request_headers.is_empty() && parsed.response_headers.is_empty() {
		return Err(ValidationError::MissingParameter(
			"requestHeaders or responseHeaders",
		));
	}
	for edit in parsed.request_headers.iter().chain(parsed.response_headers.iter()) {
		if !matches!(edit.action, Action::Delete) && edit.value.is_none() {
			return Err(ValidationError::InvalidParameter {
				name: "value",
				reason: format!("required for SET/APPEND on `{}`", edit.name),
			});
		}
	}
	Ok(parsed)
}

fn edits(raw: Vec<RawEdit>) -> Vec<HeaderEdit> {
	raw
		.into_iter()
		.map(|e| HeaderEdit {
			action: e.action.into(),
			name: e.name,
			value: e.value,
		})
		.collect()
}

fn into_request_modifications(edits: Vec<HeaderEdit>) -> UpstreamRequestModifications {
	UpstreamRequestModifications {
		header_edits: edits,
		..Default::default()
	}
}

fn into_response_modifications(edits: Vec<HeaderEdit>) -> UpstreamResponseModifications {
	UpstreamResponseModifications {
		header_edits: edits,
		..Default::default()
	}
}

impl Policy for ModifyHeaders {
	fn validate(&self, params: &Value) -> Result<(), ValidationError> {
		parse_params(params).map(|_| ())
	}

	fn has_request_hook(&self) -> bool {
		true
	}

	fn has_response_hook(&self) -> bool {
		true
	}

	fn execute_request(&self, _ctx: &mut RequestContext, params: &Value) -> Result<RequestOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;
		Ok(RequestOutcome::Continue(into_request_modifications(edits(
			params.request_headers,
		))))
	}

	fn execute_response(&self, _ctx: &mut ResponseContext, params: &Value) -> Result<ResponseOutcome, PolicyExecError> {
		let params = parse_params(params).map_err(|e| PolicyExecError::Internal(e.into()))?;
		Ok(ResponseOutcome::Continue(into_response_modifications(edits(
			params.response_headers,
		))))
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
	fn set_and_delete_applied_in_order() {
		let policy = ModifyHeaders;
		let params = json!({
			"requestHeaders": [
				{"action": "SET", "name": "x-a", "value": "1"},
				{"action": "DELETE", "name": "x-b"},
			]
		});
		let mut c = ctx();
		c.headers.apply_set("x-b", "gone").unwrap();
		let RequestOutcome::Continue(m) = policy.execute_request(&mut c, &params).unwrap() else {
			panic!("expected continue")
		};
		m.fold_into(&mut c).unwrap();
		assert_eq!(c.headers.get_first("x-a"), Some("1".to_string()));
		assert_eq!(c.headers.get_first("x-b"), None);
	}

	#[test]
	fn a_later_edit_to_the_same_header_wins_over_an_earlier_one() {
		let policy = ModifyHeaders;
		let params = json!({
			"requestHeaders": [
				{"action": "DELETE", "name": "x-a"},
				{"action": "SET", "name": "x-a", "value": "new"},
			]
		});
		let mut c = ctx();
		c.headers.apply_set("x-a", "old").unwrap();
		let RequestOutcome::Continue(m) = policy.execute_request(&mut c, &params).unwrap() else {
			panic!("expected continue")
		};
		m.fold_into(&mut c).unwrap();
		assert_eq!(c.headers.get_first("x-a"), Some("new".to_string()));
	}

	#[test]
	fn a_set_after_an_append_replaces_rather_than_accumulates() {
		let policy = ModifyHeaders;
		let params = json!({
			"requestHeaders": [
				{"action": "APPEND", "name": "x-a", "value": "2"},
				{"action": "SET", "name": "x-a", "value": "new"},
			]
		});
		let mut c = ctx();
		c.headers.apply_set("x-a", "1").unwrap();
		let RequestOutcome::Continue(m) = policy.execute_request(&mut c, &params).unwrap() else {
			panic!("expected continue")
		};
		m.fold_into(&mut c).unwrap();
		assert_eq!(c.headers.get("x-a"), Some(vec!["new".to_string()]));
	}

	#[test]
	fn missing_value_for_set_rejected() {
		let policy = ModifyHeaders;
		let params = json!({"requestHeaders": [{"action": "SET", "name": "x-a"}]});
		assert!(policy.validate(&params).is_err());
	}

	#[test]
	fn neither_array_present_rejected() {
		let policy = ModifyHeaders;
		assert!(policy.validate(&json!({})).is_err());
	}
}
