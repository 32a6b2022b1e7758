//! Built-in policy implementations.

pub mod api_key;
pub mod basic_auth;
pub mod modify_headers;
pub mod respond;
pub mod uppercase_body;

use std::sync::Arc;

use crate::cel;
use crate::policy::registry::Registry;
use crate::ratelimit::store::RateLimitStore;

/// Registers every built-in factory at v1 against `registry`. Called once
/// during process bootstrap, before the first configuration snapshot is
/// applied.
pub fn register_builtins(
	registry: &Registry,
	ratelimit_store: Arc<dyn RateLimitStore>,
	cel: Arc<cel::Evaluator>,
) -> Result<(), crate::policy::registry::Error> {
	registry.register(Arc::new(basic_auth::Factory))?;
	registry.register(Arc::new(api_key::Factory))?;
	registry.register(Arc::new(respond::Factory))?;
	registry.register(Arc::new(modify_headers::Factory))?;
	registry.register(Arc::new(uppercase_body::Factory))?;
	registry.register(Arc::new(crate::ratelimit::Factory::new(ratelimit_store, cel)))?;
	Ok(())
}
