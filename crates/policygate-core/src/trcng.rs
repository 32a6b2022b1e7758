//! Distributed tracing export via OpenTelemetry OTLP.

use std::sync::OnceLock;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_http::{HeaderExtractor, HeaderInjector};
use opentelemetry_otlp::{ExporterBuildError, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::{Deserialize, Serialize};
use tracing::info;

pub fn get_tracer() -> &'static BoxedTracer {
	static TRACER: OnceLock<BoxedTracer> = OnceLock::new();
	TRACER.get_or_init(|| global::tracer("policygate"))
}

pub fn extract_context_from_request(req: &http::HeaderMap) -> opentelemetry::Context {
	global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(req)))
}

pub fn add_context_to_request(req: &mut http::HeaderMap, ctx: &opentelemetry::Context) {
	global::get_text_map_propagator(|propagator| {
		propagator.inject_context(ctx, &mut HeaderInjector(req))
	});
}

fn get_resource() -> Resource {
	static RESOURCE: OnceLock<Resource> = OnceLock::new();
	RESOURCE
		.get_or_init(|| Resource::builder().with_service_name("policygate").build())
		.clone()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub tracer: Tracer,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Tracer {
	#[serde(rename = "otlp")]
	Otlp { endpoint: Option<String> },
}

/// Initializes the global tracer provider and propagator. Returns `Err` if
/// no endpoint is configured; callers should treat that as "tracing
/// disabled" rather than a fatal error.
pub fn init_tracer(config: Config) -> Result<SdkTracerProvider, ExporterBuildError> {
	let Tracer::Otlp { endpoint } = config.tracer;
	let Some(endpoint) = endpoint else {
		return Err(ExporterBuildError::NoHttpClient);
	};
	let composite_propagator = TextMapCompositePropagator::new(vec![
		Box::new(BaggagePropagator::new()),
		Box::new(TraceContextPropagator::new()),
	]);

	info!(endpoint, "initializing OTLP tracer");
	global::set_text_map_propagator(composite_propagator);
	let exporter = SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()?;

	let provider = SdkTracerProvider::builder()
		.with_resource(get_resource())
		.with_batch_exporter(exporter)
		.build();

	global::set_tracer_provider(provider.clone());
	Ok(provider)
}
