//! Policy factory registry and the atomically-swapped chain snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cel;
use crate::policy::{PolicyFactory, ResolvedChain, RouteChain, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("policy `{name}` v{version} is already registered")]
	AlreadyRegistered { name: String, version: u32 },
	#[error("no chain registered for route `{0}`")]
	UnknownRoute(String),
	#[error("snapshot rejected: policy `{name}` v{version} is not registered")]
	UnknownPolicy { name: String, version: u32 },
	#[error("snapshot rejected: duplicate route key `{0}`")]
	DuplicateRouteKey(String),
	#[error("snapshot rejected: policy `{name}` v{version} failed validation: {source}")]
	Validation {
		name: String,
		version: u32,
		#[source]
		source: ValidationError,
	},
	#[error("snapshot rejected: execution condition `{expr}` failed to compile: {source}")]
	ConditionCompile {
		expr: String,
		#[source]
		source: cel::Error,
	},
}

#[derive(Default)]
struct Snapshot {
	chains: HashMap<String, ResolvedChain>,
}

/// Holds policy factories keyed by `(name, version)` and the currently
/// active chain snapshot. Snapshot swap is a single pointer store: in-flight
/// requests keep the snapshot they began with.
pub struct Registry {
	factories: RwLock<HashMap<(String, u32), Arc<dyn PolicyFactory>>>,
	snapshot: RwLock<Arc<Snapshot>>,
	cel: Arc<cel::Evaluator>,
}

impl Registry {
	pub fn new(cel: Arc<cel::Evaluator>) -> Self {
		Self {
			factories: RwLock::new(HashMap::new()),
			snapshot: RwLock::new(Arc::new(Snapshot::default())),
			cel,
		}
	}

	pub fn register(&self, factory: Arc<dyn PolicyFactory>) -> Result<(), Error> {
		let key = (factory.name().to_string(), factory.version());
		let mut factories = self.factories.write().unwrap();
		if factories.contains_key(&key) {
			return Err(Error::AlreadyRegistered {
				name: key.0,
				version: key.1,
			});
		}
		factories.insert(key, factory);
		Ok(())
	}

	pub fn resolve_chain(&self, route_key: &str) -> Result<ResolvedChain, Error> {
		self
			.snapshot
			.read()
			.unwrap()
			.chains
			.get(route_key)
			.cloned()
			.ok_or_else(|| Error::UnknownRoute(route_key.to_string()))
	}

	/// Validates every referenced `(name,version)` is registered, every
	/// policy's parameters pass `Validate`, and every `executionCondition`
	/// compiles — then swaps the chain table atomically. On any failure the
	/// previous snapshot remains active.
	pub fn apply_snapshot(&self, chains: Vec<RouteChain>) -> Result<(), Error> {
		let factories = self.factories.read().unwrap();
		let mut seen_routes = std::collections::HashSet::new();
		let mut resolved = HashMap::with_capacity(chains.len());

		for chain in chains {
			if !seen_routes.insert(chain.route_key.clone()) {
				return Err(Error::DuplicateRouteKey(chain.route_key));
			}
			let mut policies = Vec::with_capacity(chain.specs.len());
			for spec in &chain.specs {
				let key = (spec.name.clone(), spec.version);
				let factory = factories.get(&key).ok_or_else(|| Error::UnknownPolicy {
					name: spec.name.clone(),
					version: spec.version,
				})?;
				let policy = factory.create();
				policy
					.validate(&spec.parameters)
					.map_err(|source| Error::Validation {
						name: spec.name.clone(),
						version: spec.version,
						source,
					})?;
				if let Some(expr) = &spec.execution_condition {
					self
						.cel
						.compile(expr, cel::Role::Condition)
						.map_err(|source| Error::ConditionCompile {
							expr: expr.clone(),
							source,
						})?;
				}
				policies.push(policy);
			}
			resolved.insert(
				chain.route_key.clone(),
				ResolvedChain {
					route_key: chain.route_key,
					specs: chain.specs,
					policies,
				},
			);
		}

		let mut snapshot = self.snapshot.write().unwrap();
		*snapshot = Arc::new(Snapshot { chains: resolved });
		Ok(())
	}

	pub fn route_count(&self) -> usize {
		self.snapshot.read().unwrap().chains.len()
	}
}
