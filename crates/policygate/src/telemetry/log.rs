//! Emits a per-phase structured observability record, gated by an optional
//! CEL filter expression and enriched with CEL-evaluated extra fields, with
//! a fixed record shape rather than a generic access-log pipeline.

use std::collections::BTreeMap;

use crate::cel;
use crate::context::{RequestContext, ResponseContext};
use crate::policy::{PhaseResult, PolicyOutcome};

/// One named CEL expression evaluated for every emitted record and added
/// as an extra field.
#[derive(Debug, Clone)]
pub struct ExtraField {
	pub name: String,
	pub expression: String,
}

/// Logging configuration: an optional CEL filter gating which phase
/// results get logged, plus a fixed list of extra fields to compute per
/// record.
#[derive(Debug, Clone, Default)]
pub struct Config {
	pub filter: Option<String>,
	pub fields: Vec<ExtraField>,
}

/// Emits one `tracing` event per [`PhaseResult`], applying `config`'s
/// filter and field enrichment. A filter or field evaluation error never
/// suppresses the base record — it is reported once as a `warn` and the
/// record is still emitted, since losing observability to an expression
/// bug is worse than a missing field.
pub fn emit(
	cel: &cel::Evaluator,
	config: &Config,
	req: &RequestContext,
	resp: Option<&ResponseContext>,
	result: &PhaseResult,
) {
	if let Some(expr) = &config.filter {
		match cel.evaluate_log_filter(expr, req, resp) {
			Ok(false) => return,
			Ok(true) => {},
			Err(err) => tracing::warn!(%err, expr, "telemetry filter failed to evaluate, logging anyway"),
		}
	}

	let (skipped, short_circuited, error) = match &result.outcome {
		PolicyOutcome::Skipped => (true, false, None),
		PolicyOutcome::Continued => (false, false, None),
		PolicyOutcome::ShortCircuited => (false, true, None),
		PolicyOutcome::Failed(msg) => (false, false, Some(msg.clone())),
	};

	let mut extra = BTreeMap::new();
	for field in &config.fields {
		match cel.evaluate_log_field(&field.expression, req, resp) {
			Ok(value) => {
				extra.insert(field.name.clone(), value);
			},
			Err(err) => tracing::warn!(%err, field = field.name.as_str(), "telemetry field failed to evaluate"),
		}
	}

	tracing::debug!(
		route_key = %result.route_key,
		policy_name = %result.policy_name,
		policy_version = result.policy_version,
		skipped,
		short_circuited,
		elapsed_ns = result.elapsed.as_nanos() as u64,
		error = ?error,
		extra = ?extra,
		"policy phase execution",
	);
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use http::Method;

	use super::*;
	use crate::context::Headers;

	fn req() -> RequestContext {
		RequestContext::new(Method::GET, "/widgets".into(), Headers::new(), "r1".into())
	}

	fn result(outcome: PolicyOutcome) -> PhaseResult {
		PhaseResult {
			route_key: "r1".into(),
			policy_name: "respond".into(),
			policy_version: 1,
			outcome,
			elapsed: Duration::from_millis(1),
		}
	}

	#[test]
	fn filter_false_suppresses_the_record() {
		let cel = cel::Evaluator::new();
		let config = Config {
			filter: Some("false".into()),
			fields: vec![],
		};
		emit(&cel, &config, &req(), None, &result(PolicyOutcome::Continued));
	}

	#[test]
	fn field_evaluation_error_does_not_panic() {
		let cel = cel::Evaluator::new();
		let config = Config {
			filter: None,
			fields: vec![ExtraField {
				name: "bogus".into(),
				expression: "undefined_identifier".into(),
			}],
		};
		emit(&cel, &config, &req(), None, &result(PolicyOutcome::Skipped));
	}

	#[test]
	fn no_filter_always_emits() {
		let cel = cel::Evaluator::new();
		let config = Config::default();
		emit(&cel, &config, &req(), None, &result(PolicyOutcome::ShortCircuited));
	}
}
