//! The shared counter store abstraction: a key-value store supporting
//! atomic server-side updates with numeric TAT and TTL semantics. The
//! default implementation is an in-process map; a Redis-compatible or
//! other out-of-process store is expected to implement the same trait for
//! multi-replica deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("rate-limit store is unavailable: {0}")]
	Unavailable(String),
}

/// One atomic read-modify-write round trip against the shared counter
/// store: read the current TAT for `key` (or `now_ns` on miss), run `f`,
/// and if `f` returns `Some(new_tat)` write it back with `ttl`. The whole
/// operation executes as a single critical section per key, so concurrent
/// callers for the same key never interleave their read and write.
#[async_trait]
pub trait RateLimitStore: Send + Sync + std::fmt::Debug {
	async fn get_and_update(
		&self,
		key: &str,
		now_ns: i64,
		f: &(dyn Fn(i64) -> Option<i64> + Send + Sync),
		ttl: Duration,
	) -> Result<i64, Error>;
}

#[derive(Debug)]
struct Entry {
	tat_ns: i64,
	expires_at: Instant,
}

/// An atomic, single-process implementation backed by a mutex-guarded map.
/// Expired entries are reaped lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
	async fn get_and_update(
		&self,
		key: &str,
		now_ns: i64,
		f: &(dyn Fn(i64) -> Option<i64> + Send + Sync),
		ttl: Duration,
	) -> Result<i64, Error> {
		let mut entries = self.entries.lock().unwrap();
		let now = Instant::now();

		let current = match entries.get(key) {
			Some(entry) if entry.expires_at > now => entry.tat_ns,
			_ => now_ns,
		};

		if let Some(new_tat) = f(current) {
			entries.insert(
				key.to_string(),
				Entry {
					tat_ns: new_tat,
					expires_at: now + ttl,
				},
			);
		}

		Ok(current)
	}
}
