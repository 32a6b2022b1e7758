//! Translates an incoming configuration-snapshot payload into
//! [`RouteChain`]s and applies it to the [`Registry`].

use serde::Deserialize;

use crate::policy::registry::{Error, Registry};
use crate::policy::{PolicySpec, RouteChain};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePolicySpec {
	name: String,
	#[serde(default = "default_version")]
	version: u32,
	#[serde(default = "default_enabled")]
	enabled: bool,
	#[serde(default)]
	parameters: serde_json::Value,
	#[serde(default)]
	execution_condition: Option<String>,
}

fn default_version() -> u32 {
	1
}

fn default_enabled() -> bool {
	true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRouteChain {
	route_key: String,
	#[serde(default)]
	policies: Vec<WirePolicySpec>,
}

#[derive(Debug, Deserialize)]
struct SnapshotPayload {
	chains: Vec<WireRouteChain>,
}

/// Parses `payload` as a full chain snapshot and applies it; any
/// validation failure leaves the previously active snapshot untouched
/// (`Registry::apply_snapshot`'s all-or-nothing contract).
pub fn apply(registry: &Registry, payload: serde_json::Value) -> Result<(), Error> {
	let parsed: SnapshotPayload = serde_json::from_value(payload).map_err(|e| Error::UnknownPolicy {
		name: format!("malformed snapshot payload: {e}"),
		version: 0,
	})?;

	let chains = parsed
		.chains
		.into_iter()
		.map(|chain| RouteChain {
			route_key: chain.route_key,
			specs: chain
				.policies
				.into_iter()
				.map(|p| PolicySpec {
					name: p.name,
					version: p.version,
					enabled: p.enabled,
					parameters: p.parameters,
					execution_condition: p.execution_condition,
				})
				.collect(),
		})
		.collect();

	registry.apply_snapshot(chains)
}
