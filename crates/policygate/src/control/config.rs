//! Environment-variable-driven, YAML-backed process configuration, including
//! default listener ports and the telemetry filter/field expressions.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::telemetry::log::{Config as LogConfig, ExtraField};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawLogField {
	pub name: String,
	pub expression: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
	pub event_channel_addr: Option<String>,
	pub ext_proc_addr: Option<String>,
	pub admin_addr: Option<String>,
	pub gateway_id: Option<String>,
	pub api_key: Option<String>,
	pub heartbeat_interval_secs: Option<u64>,
	pub heartbeat_timeout_secs: Option<u64>,
	pub max_payload_bytes: Option<usize>,
	pub log_filter: Option<String>,
	#[serde(default)]
	pub log_fields: Vec<RawLogField>,
}

#[derive(Debug, Clone)]
pub struct Config {
	pub event_channel_addr: SocketAddr,
	pub ext_proc_addr: SocketAddr,
	pub admin_addr: SocketAddr,
	pub gateway_id: String,
	pub api_key: Option<String>,
	pub heartbeat_interval: Duration,
	pub heartbeat_timeout: Duration,
	pub max_payload_bytes: usize,
	pub log: LogConfig,
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

fn socket_addr(raw: Option<String>, default_port: u16) -> anyhow::Result<SocketAddr> {
	match raw {
		Some(addr) => addr.parse().map_err(|e| anyhow::anyhow!("invalid socket address `{addr}`: {e}")),
		None => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), default_port)),
	}
}

/// Loads configuration from an optional YAML file, overlaid by environment
/// variables — an environment variable always wins over the corresponding
/// file field.
pub fn load(path: Option<PathBuf>) -> anyhow::Result<Config> {
	let raw: RawConfig = match path {
		Some(path) => {
			let contents = std::fs::read_to_string(&path)
				.map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
			serde_yaml::from_str(&contents)?
		},
		None => RawConfig::default(),
	};

	let event_channel_addr = socket_addr(parse("EVENT_CHANNEL_ADDR")?.or(raw.event_channel_addr), 8443)?;
	let ext_proc_addr = socket_addr(parse("EXT_PROC_ADDR")?.or(raw.ext_proc_addr), 9243)?;
	let admin_addr = socket_addr(parse("ADMIN_ADDR")?.or(raw.admin_addr), 15021)?;

	let gateway_id = parse("GATEWAY_ID")?.or(raw.gateway_id).unwrap_or_else(|| "default".to_string());
	let api_key = parse("POLICYGATE_API_KEY")?.or(raw.api_key);

	let heartbeat_interval = Duration::from_secs(
		parse("HEARTBEAT_INTERVAL_SECS")?
			.or(raw.heartbeat_interval_secs)
			.unwrap_or(20),
	);
	let heartbeat_timeout = Duration::from_secs(
		parse("HEARTBEAT_TIMEOUT_SECS")?
			.or(raw.heartbeat_timeout_secs)
			.unwrap_or(30),
	);
	let max_payload_bytes = parse("MAX_PAYLOAD_BYTES")?.or(raw.max_payload_bytes).unwrap_or(1024 * 1024);

	let log_filter = parse("LOG_FILTER")?.or(raw.log_filter);
	let log = LogConfig {
		filter: log_filter,
		fields: raw
			.log_fields
			.into_iter()
			.map(|f| ExtraField {
				name: f.name,
				expression: f.expression,
			})
			.collect(),
	};

	Ok(Config {
		event_channel_addr,
		ext_proc_addr,
		admin_addr,
		gateway_id,
		api_key,
		heartbeat_interval,
		heartbeat_timeout,
		max_payload_bytes,
		log,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_without_file_or_env() {
		let cfg = load(None).unwrap();
		assert_eq!(cfg.event_channel_addr.port(), 8443);
		assert_eq!(cfg.ext_proc_addr.port(), 9243);
		assert_eq!(cfg.heartbeat_interval, Duration::from_secs(20));
		assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(30));
		assert_eq!(cfg.max_payload_bytes, 1024 * 1024);
	}

	#[test]
	fn yaml_file_overrides_defaults() {
		let dir = std::env::temp_dir();
		let path = dir.join(format!("policygate-test-config-{:?}.yaml", std::thread::current().id()));
		std::fs::write(&path, "gatewayId: my-gw\nheartbeatIntervalSecs: 5\n").unwrap();
		let cfg = load(Some(path.clone())).unwrap();
		std::fs::remove_file(&path).ok();
		assert_eq!(cfg.gateway_id, "my-gw");
		assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
	}

	#[test]
	fn log_fields_are_parsed_from_yaml() {
		let dir = std::env::temp_dir();
		let path = dir.join(format!("policygate-test-log-config-{:?}.yaml", std::thread::current().id()));
		std::fs::write(
			&path,
			"logFilter: \"response.statusCode >= 400\"\nlogFields:\n  - name: routeKey\n    expression: \"request.path\"\n",
		)
		.unwrap();
		let cfg = load(Some(path.clone())).unwrap();
		std::fs::remove_file(&path).ok();
		assert_eq!(cfg.log.filter.as_deref(), Some("response.statusCode >= 400"));
		assert_eq!(cfg.log.fields.len(), 1);
		assert_eq!(cfg.log.fields[0].name, "routeKey");
	}
}
