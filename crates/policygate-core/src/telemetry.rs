//! Structured logging bootstrap.
//!
//! Logs are emitted through `tracing`, formatted either as human-readable
//! text (the default) or newline-delimited JSON when `LOG_FORMAT=json` is
//! set, and filtered through `RUST_LOG`/`LOG_LEVEL` via `EnvFilter`.

use std::env;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

impl LogFormat {
	pub fn from_env() -> Self {
		match env::var("LOG_FORMAT").as_deref() {
			Ok("json") => LogFormat::Json,
			_ => LogFormat::Text,
		}
	}
}

/// Installs the global `tracing` subscriber. Must be called once at process
/// startup before any `tracing` macros are used.
pub fn init() {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_env("RUST_LOG")
		.or_else(|_| EnvFilter::try_new(env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
		.unwrap_or_else(|_| EnvFilter::new("info"));

	let registry = tracing_subscriber::registry().with(filter);
	match LogFormat::from_env() {
		LogFormat::Json => {
			let layer = tracing_subscriber::fmt::layer()
				.json()
				.with_span_events(FmtSpan::NONE)
				.with_target(true);
			registry.with(layer).init();
		},
		LogFormat::Text => {
			let layer = tracing_subscriber::fmt::layer().with_target(true);
			registry.with(layer).init();
		},
	}
}
