//! Control-plane configuration loading and the gateway event channel.

pub mod config;
pub mod event_channel;
pub mod snapshot;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::control::event_channel::ConnectionTable;
use crate::policy::registry::Registry;

/// Builds the router serving the event-channel upgrade endpoint at the
/// well-known internal path, and spawns the background task that reaps
/// connections that have missed their heartbeat deadline.
pub fn router(registry: Arc<Registry>, config: Arc<config::Config>) -> Router {
	let table = ConnectionTable::new(registry, config);
	tokio::spawn(event_channel::reap_stale_connections(table.clone()));
	Router::new()
		.route("/internal/event-channel", get(event_channel::upgrade))
		.with_state(table)
}
