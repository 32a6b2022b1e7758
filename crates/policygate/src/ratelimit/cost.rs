//! Ordered cost-extraction sources.

use serde::Deserialize;
use serde_json::Value;

use crate::cel;
use crate::context::{RequestContext, ResponseContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CostSource {
	ResponseHeader { key: String },
	Metadata { key: String },
	ResponseBody { json_path: String },
	RequestCel { expression: String },
	ResponseCel { expression: String },
}

/// Tries each source in order on the request phase (only `Metadata` and
/// `RequestCel` are meaningful before a response exists); returns the first
/// non-negative number produced.
pub fn extract_request_cost(sources: &[CostSource], cel: &cel::Evaluator, req: &RequestContext) -> Option<f64> {
	for source in sources {
		let value = match source {
			CostSource::Metadata { key } => metadata_numeric(req.metadata.get(key)),
			CostSource::RequestCel { expression } => cel.evaluate_request_cost(expression, req).ok(),
			_ => None,
		};
		if let Some(v) = value.filter(|v| *v >= 0.0) {
			return Some(v);
		}
	}
	None
}

/// Tries each source in order on the response phase; all five source kinds
/// apply.
pub fn extract_response_cost(sources: &[CostSource], cel: &cel::Evaluator, resp: &ResponseContext) -> Option<f64> {
	for source in sources {
		let value = match source {
			CostSource::ResponseHeader { key } => resp
				.response_headers
				.get_first(key)
				.and_then(|v| v.trim().parse::<u64>().ok())
				.map(|v| v as f64),
			CostSource::Metadata { key } => metadata_numeric(resp.request.metadata.get(key)),
			CostSource::ResponseBody { json_path } => body_numeric(&resp.response_body.content, json_path),
			CostSource::RequestCel { expression } => cel.evaluate_request_cost(expression, &resp.request).ok(),
			CostSource::ResponseCel { expression } => cel.evaluate_response_cost(expression, resp).ok(),
		};
		if let Some(v) = value.filter(|v| *v >= 0.0) {
			return Some(v);
		}
	}
	None
}

fn metadata_numeric(value: Option<&Value>) -> Option<f64> {
	match value? {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.parse::<f64>().ok(),
		_ => None,
	}
}

/// Extracts a string at `json_path` (a simple `.`-separated field path, not
/// full JSONPath) from a JSON body and parses it as a non-negative integer.
fn body_numeric(body: &[u8], json_path: &str) -> Option<f64> {
	let root: Value = serde_json::from_slice(body).ok()?;
	let mut current = &root;
	for segment in json_path.trim_start_matches('$').trim_start_matches('.').split('.') {
		if segment.is_empty() {
			continue;
		}
		current = current.get(segment)?;
	}
	match current {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.parse::<f64>().ok(),
		_ => None,
	}
}
