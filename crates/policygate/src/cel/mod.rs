//! CEL compilation cache and the request/response/key/cost evaluation
//! surface.

mod environment;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cel_interpreter::{Context as CelContext, Value as CelValue};
use cel_parser::Expression as CelExpression;

pub use environment::{build_condition_context, build_request_context, build_response_context};

use crate::context::{RequestContext, ResponseContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
	Key,
	Cost,
	Condition,
}

impl Role {
	fn as_str(self) -> &'static str {
		match self {
			Role::Key => "key",
			Role::Cost => "cost",
			Role::Condition => "condition",
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("failed to parse expression `{expr}`: {detail}")]
	Parse { expr: String, detail: String },
	#[error("failed to evaluate expression `{expr}`: {detail}")]
	Evaluate { expr: String, detail: String },
	#[error("expression `{expr}` produced {actual}, expected {expected}")]
	WrongType {
		expr: String,
		expected: &'static str,
		actual: &'static str,
	},
}

/// Compiles, caches, and evaluates CEL expressions. The cache is a
/// process-wide `role:expression -> parsed expression` map; reads take a
/// shared lock and writes use double-checked locking so two callers
/// compiling the same expression concurrently do not both insert.
#[derive(Debug)]
pub struct Evaluator {
	cache: RwLock<HashMap<String, Arc<CelExpression>>>,
}

impl Default for Evaluator {
	fn default() -> Self {
		Self::new()
	}
}

impl Evaluator {
	pub fn new() -> Self {
		Self {
			cache: RwLock::new(HashMap::new()),
		}
	}

	fn cache_key(expr: &str, role: Role) -> String {
		format!("{}:{}", role.as_str(), expr)
	}

	pub fn compile(&self, expr: &str, role: Role) -> Result<Arc<CelExpression>, Error> {
		let key = Self::cache_key(expr, role);
		if let Some(parsed) = self.cache.read().unwrap().get(&key) {
			return Ok(parsed.clone());
		}
		let parsed = Arc::new(cel_parser::parse(expr).map_err(|e| Error::Parse {
			expr: expr.to_string(),
			detail: e.to_string(),
		})?);

		let mut cache = self.cache.write().unwrap();
		// Double-checked: another writer may have inserted while we compiled.
		Ok(cache.entry(key).or_insert_with(|| parsed).clone())
	}

	pub fn len(&self) -> usize {
		self.cache.read().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn execute(&self, expr: &str, role: Role, ctx: &CelContext) -> Result<CelValue, Error> {
		let parsed = self.compile(expr, role)?;
		CelValue::resolve(&parsed, ctx).map_err(|e| Error::Evaluate {
			expr: expr.to_string(),
			detail: e.to_string(),
		})
	}

	/// `EvaluateKey(expr, reqCtx, routeName) -> string`.
	pub fn evaluate_key(&self, expr: &str, req: &RequestContext) -> Result<String, Error> {
		let ctx = build_request_context(req);
		match self.execute(expr, Role::Key, &ctx)? {
			CelValue::String(s) => Ok(s.to_string()),
			other => Err(Error::WrongType {
				expr: expr.to_string(),
				expected: "string",
				actual: value_type_name(&other),
			}),
		}
	}

	/// `EvaluateRequestCost(expr, reqCtx) -> float`.
	pub fn evaluate_request_cost(&self, expr: &str, req: &RequestContext) -> Result<f64, Error> {
		let ctx = build_request_context(req);
		self.coerce_numeric(expr, Role::Cost, &ctx)
	}

	/// `EvaluateResponseCost(expr, respCtx) -> float`.
	pub fn evaluate_response_cost(&self, expr: &str, resp: &ResponseContext) -> Result<f64, Error> {
		let ctx = build_response_context(resp);
		self.coerce_numeric(expr, Role::Cost, &ctx)
	}

	/// `EvaluateCondition(expr, ctx, phase) -> bool`.
	pub fn evaluate_condition_request(&self, expr: &str, req: &RequestContext) -> Result<bool, Error> {
		let ctx = build_condition_context(req, None);
		self.coerce_bool(expr, &ctx)
	}

	pub fn evaluate_condition_response(&self, expr: &str, resp: &ResponseContext) -> Result<bool, Error> {
		let ctx = build_condition_context(&resp.request, Some(resp));
		self.coerce_bool(expr, &ctx)
	}

	/// Evaluates a telemetry filter expression against the same
	/// request/response view `executionCondition` sees.
	pub fn evaluate_log_filter(&self, expr: &str, req: &RequestContext, resp: Option<&ResponseContext>) -> Result<bool, Error> {
		let ctx = build_condition_context(req, resp);
		self.coerce_bool(expr, &ctx)
	}

	/// Evaluates a telemetry extra-field expression, coercing the
	/// result into a JSON value suitable for a structured log record.
	pub fn evaluate_log_field(&self, expr: &str, req: &RequestContext, resp: Option<&ResponseContext>) -> Result<serde_json::Value, Error> {
		let ctx = build_condition_context(req, resp);
		self.execute(expr, Role::Key, &ctx).map(|v| cel_value_to_json(&v))
	}

	fn coerce_bool(&self, expr: &str, ctx: &CelContext) -> Result<bool, Error> {
		match self.execute(expr, Role::Condition, ctx)? {
			CelValue::Bool(b) => Ok(b),
			other => Err(Error::WrongType {
				expr: expr.to_string(),
				expected: "bool",
				actual: value_type_name(&other),
			}),
		}
	}

	/// Coerces int/uint/float results to `f64`; any other produced type is
	/// an evaluation error.
	fn coerce_numeric(&self, expr: &str, role: Role, ctx: &CelContext) -> Result<f64, Error> {
		match self.execute(expr, role, ctx)? {
			CelValue::Int(i) => Ok(i as f64),
			CelValue::UInt(u) => Ok(u as f64),
			CelValue::Float(f) => Ok(f),
			other => Err(Error::WrongType {
				expr: expr.to_string(),
				expected: "numeric",
				actual: value_type_name(&other),
			}),
		}
	}
}

/// Best-effort coercion to JSON for telemetry enrichment fields; composite
/// values (`Map`/`List`) and raw `Bytes` are not currently reproduced
/// losslessly and collapse to a placeholder string.
fn cel_value_to_json(v: &CelValue) -> serde_json::Value {
	match v {
		CelValue::Int(i) => serde_json::Value::from(*i),
		CelValue::UInt(u) => serde_json::Value::from(*u),
		CelValue::Float(f) => serde_json::Value::from(*f),
		CelValue::String(s) => serde_json::Value::String(s.to_string()),
		CelValue::Bool(b) => serde_json::Value::Bool(*b),
		CelValue::Null => serde_json::Value::Null,
		_ => serde_json::Value::String("<unrepresentable>".to_string()),
	}
}

fn value_type_name(v: &CelValue) -> &'static str {
	match v {
		CelValue::Int(_) => "int",
		CelValue::UInt(_) => "uint",
		CelValue::Float(_) => "float",
		CelValue::String(_) => "string",
		CelValue::Bytes(_) => "bytes",
		CelValue::Bool(_) => "bool",
		CelValue::Map(_) => "map",
		CelValue::List(_) => "list",
		CelValue::Null => "null",
		_ => "other",
	}
}
