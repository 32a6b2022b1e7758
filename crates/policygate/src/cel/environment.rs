//! Serializable views of the request/response contexts that get handed to
//! `cel_interpreter::to_value` to build the `request`/`response` CEL
//! variables used by the key, cost, and condition evaluation roles.

use std::collections::HashMap;

use cel_interpreter::{Context, Value};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::context::{RequestContext, ResponseContext};

#[derive(Serialize)]
struct ApiIdentityView<'a> {
	#[serde(rename = "apiId")]
	api_id: &'a str,
	#[serde(rename = "apiName")]
	api_name: &'a str,
	#[serde(rename = "apiVersion")]
	api_version: &'a str,
	#[serde(rename = "apiContext")]
	api_context: &'a str,
}

#[derive(Serialize)]
struct RequestView<'a> {
	method: &'a str,
	path: &'a str,
	headers: HashMap<String, Vec<String>>,
	metadata: &'a HashMap<String, JsonValue>,
	#[serde(rename = "routeName")]
	route_name: &'a str,
	api: ApiIdentityView<'a>,
}

#[derive(Serialize)]
struct ResponseView<'a> {
	#[serde(flatten)]
	request: RequestView<'a>,
	#[serde(rename = "responseHeaders")]
	response_headers: HashMap<String, Vec<String>>,
	#[serde(rename = "responseStatus")]
	response_status: u16,
}

fn request_view(req: &RequestContext) -> RequestView<'_> {
	RequestView {
		method: req.method.as_str(),
		path: &req.path,
		headers: req.headers.get_all(),
		metadata: &req.metadata,
		route_name: &req.route_name,
		api: ApiIdentityView {
			api_id: &req.api.api_id,
			api_name: &req.api.api_name,
			api_version: &req.api.api_version,
			api_context: &req.api.api_context,
		},
	}
}

fn to_value(v: impl Serialize) -> Value {
	cel_interpreter::to_value(v).unwrap_or(Value::Null)
}

/// Builds a scope exposing `request` for the key/cost-on-request
/// environments.
pub fn build_request_context(req: &RequestContext) -> Context<'static> {
	let mut ctx = Context::default();
	ctx.add_variable_from_value("request", to_value(request_view(req)));
	ctx
}

/// Builds a scope exposing `request` and `response` for the
/// cost-on-response environment.
pub fn build_response_context(resp: &ResponseContext) -> Context<'static> {
	let mut ctx = Context::default();
	ctx.add_variable_from_value("request", to_value(request_view(&resp.request)));
	ctx.add_variable_from_value(
		"response",
		to_value(ResponseView {
			request: request_view(&resp.request),
			response_headers: resp.response_headers.get_all(),
			response_status: resp.response_status.as_u16(),
		}),
	);
	ctx
}

/// Builds the condition environment: `request` always, `response` when the
/// condition is evaluated during the response phase.
pub fn build_condition_context(req: &RequestContext, resp: Option<&ResponseContext>) -> Context<'static> {
	match resp {
		Some(resp) => build_response_context(resp),
		None => build_request_context(req),
	}
}
