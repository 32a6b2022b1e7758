//! The control-plane event channel: a persistent WebSocket session per
//! gateway connection, JSON envelopes, heartbeat liveness, and bounded
//! per-connection fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::control::config::Config;
use crate::control::snapshot;
use crate::policy::registry::Registry;

pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// `{type, payload}` — the wire envelope for every message on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: String,
	pub payload: serde_json::Value,
}

impl Envelope {
	pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
		Self {
			kind: kind.into(),
			payload,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Live,
	Stale,
	Closed,
}

struct Connection {
	gateway_id: String,
	outbound: mpsc::Sender<Message>,
	last_heartbeat: Instant,
}

/// Process-wide connection table: a single mutex guards writes (register,
/// remove, per-connection heartbeat bump); reads for stats use the same
/// lock since the table is small and short-held and this gateway does not
/// need lock-free stats reads at this connection-table scale.
#[derive(Clone)]
pub struct ConnectionTable {
	inner: Arc<Mutex<HashMap<Uuid, Connection>>>,
	registry: Arc<Registry>,
	config: Arc<Config>,
}

impl ConnectionTable {
	pub fn new(registry: Arc<Registry>, config: Arc<Config>) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			registry,
			config,
		}
	}

	fn register(&self, gateway_id: String, outbound: mpsc::Sender<Message>) -> Uuid {
		let id = Uuid::new_v4();
		self.inner.lock().unwrap().insert(
			id,
			Connection {
				gateway_id,
				outbound,
				last_heartbeat: Instant::now(),
			},
		);
		id
	}

	fn touch_heartbeat(&self, id: Uuid) {
		if let Some(conn) = self.inner.lock().unwrap().get_mut(&id) {
			conn.last_heartbeat = Instant::now();
		}
	}

	fn remove(&self, id: Uuid) {
		self.inner.lock().unwrap().remove(&id);
	}

	/// Connections whose `now - lastHeartbeat` exceeds the configured
	/// timeout; the caller closes and removes them.
	pub fn stale_connections(&self) -> Vec<Uuid> {
		let now = Instant::now();
		self
			.inner
			.lock()
			.unwrap()
			.iter()
			.filter(|(_, c)| now.duration_since(c.last_heartbeat) > self.config.heartbeat_timeout)
			.map(|(id, _)| *id)
			.collect()
	}

	/// Fans an event out to every live connection sharing `gateway_id`.
	/// A full outbound queue drops that connection from delivery for this
	/// event rather than blocking the producer.
	pub fn broadcast(&self, gateway_id: &str, envelope: &Envelope) {
		let message = match serde_json::to_string(envelope) {
			Ok(s) => Message::Text(s.into()),
			Err(_) => return,
		};
		let connections = self.inner.lock().unwrap();
		for conn in connections.values().filter(|c| c.gateway_id == gateway_id) {
			let _ = conn.outbound.try_send(message.clone());
		}
	}

	pub fn connection_count(&self) -> usize {
		self.inner.lock().unwrap().len()
	}
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
	#[serde(rename = "apiKey")]
	pub api_key: Option<String>,
	#[serde(rename = "gatewayId")]
	pub gateway_id: Option<String>,
}

fn authenticate(config: &Config, query: &AuthQuery, bearer: Option<&str>) -> bool {
	match &config.api_key {
		None => true,
		Some(expected) => query.api_key.as_deref() == Some(expected.as_str()) || bearer == Some(expected.as_str()),
	}
}

pub async fn upgrade(
	ws: WebSocketUpgrade,
	State(table): State<ConnectionTable>,
	Query(query): Query<AuthQuery>,
	headers: axum::http::HeaderMap,
) -> Response {
	let bearer = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));

	if !authenticate(&table.config, &query, bearer) {
		return axum::http::StatusCode::UNAUTHORIZED.into_response();
	}

	let gateway_id = query.gateway_id.unwrap_or_else(|| "default".to_string());
	ws.on_upgrade(move |socket| handle_connection(socket, table, gateway_id))
}

async fn handle_connection(socket: WebSocket, table: ConnectionTable, gateway_id: String) {
	let (mut sink, mut stream) = socket.split();
	let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
	let id = table.register(gateway_id.clone(), tx.clone());

	let welcome = Envelope::new("connected", serde_json::json!({"connectionId": id.to_string()}));
	if let Ok(text) = serde_json::to_string(&welcome) {
		let _ = tx.try_send(Message::Text(text.into()));
	}

	let writer = tokio::spawn(async move {
		while let Some(message) = rx.recv().await {
			if sink.send(message).await.is_err() {
				break;
			}
		}
	});

	while let Some(Ok(message)) = stream.next().await {
		match message {
			Message::Text(text) => {
				if text.len() > table.config.max_payload_bytes {
					break;
				}
				handle_inbound(&table, &gateway_id, id, &text).await;
			},
			Message::Ping(_) | Message::Pong(_) => {
				table.touch_heartbeat(id);
			},
			Message::Close(_) => break,
			Message::Binary(data) if data.len() > table.config.max_payload_bytes => break,
			Message::Binary(_) => {},
		}
	}

	table.remove(id);
	writer.abort();
}

async fn handle_inbound(table: &ConnectionTable, gateway_id: &str, id: Uuid, text: &str) {
	let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
		return;
	};
	match envelope.kind.as_str() {
		"ping" => table.touch_heartbeat(id),
		"snapshot" | "gateway.config.updated" => {
			if let Err(err) = snapshot::apply(&table.registry, envelope.payload) {
				tracing::warn!(?err, gateway_id, "rejected configuration snapshot");
			}
		},
		"api.deployed" | "api.undeployed" => {
			tracing::debug!(kind = %envelope.kind, gateway_id, "received deployment event");
		},
		other => {
			tracing::debug!(kind = other, "ignoring unrecognized event channel message type");
		},
	}
}

/// Background task that closes and reaps stale connections; run once per
/// `heartbeat_timeout` interval for the lifetime of the process.
pub async fn reap_stale_connections(table: ConnectionTable) {
	let mut interval = tokio::time::interval(table.config.heartbeat_timeout);
	loop {
		interval.tick().await;
		for id in table.stale_connections() {
			table.remove(id);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(timeout_secs: u64) -> Config {
		Config {
			event_channel_addr: "0.0.0.0:8443".parse().unwrap(),
			ext_proc_addr: "0.0.0.0:9243".parse().unwrap(),
			admin_addr: "0.0.0.0:15021".parse().unwrap(),
			gateway_id: "gw".into(),
			api_key: Some("s3cr3t".into()),
			heartbeat_interval: Duration::from_secs(20),
			heartbeat_timeout: Duration::from_millis(10),
			max_payload_bytes: 1024,
		}
	}

	#[test]
	fn authenticate_accepts_matching_query_key() {
		let cfg = config(30);
		let query = AuthQuery {
			api_key: Some("s3cr3t".into()),
			gateway_id: None,
		};
		assert!(authenticate(&cfg, &query, None));
	}

	#[test]
	fn authenticate_rejects_missing_key() {
		let cfg = config(30);
		let query = AuthQuery {
			api_key: None,
			gateway_id: None,
		};
		assert!(!authenticate(&cfg, &query, None));
	}

	#[test]
	fn authenticate_accepts_bearer_token() {
		let cfg = config(30);
		let query = AuthQuery {
			api_key: None,
			gateway_id: None,
		};
		assert!(authenticate(&cfg, &query, Some("s3cr3t")));
	}

	#[tokio::test]
	async fn stale_connection_is_detected_after_timeout() {
		let registry = Arc::new(Registry::new(Arc::new(crate::cel::Evaluator::new())));
		let table = ConnectionTable::new(registry, Arc::new(config(30)));
		let (tx, _rx) = mpsc::channel(4);
		let id = table.register("gw".into(), tx);
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(table.stale_connections(), vec![id]);
	}
}
