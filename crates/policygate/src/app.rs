//! Process bootstrap: wires the CEL evaluator, policy registry and
//! built-in policies, the ext_proc gRPC server, and the control-plane
//! event-channel HTTP server, with graceful shutdown via
//! [`policygate_core::drain`].

use std::sync::Arc;

use policygate_core::{drain, readiness, signal};
use tonic::transport::Server;
use tracing::{error, info};

use crate::cel;
use crate::control;
use crate::policies;
use crate::policy::kernel::Kernel;
use crate::policy::registry::Registry;
use crate::ratelimit::store::InMemoryStore;
use crate::transport::ext_proc::ExtProcService;
use crate::transport::ext_proc::proto::external_processor_server::ExternalProcessorServer;

/// Builds every long-running component and returns once they are spawned;
/// callers await [`Bound::wait_termination`] to block until shutdown.
pub async fn run(config: Arc<control::config::Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = readiness::Ready::new();

	let cel = Arc::new(cel::Evaluator::new());
	let registry = Arc::new(Registry::new(cel.clone()));
	policies::register_builtins(&registry, Arc::new(InMemoryStore::new()), cel.clone())?;
	let kernel = Arc::new(Kernel::new(cel.clone()));
	let log_config = Arc::new(config.log.clone());

	spawn_ext_proc_server(
		config.clone(),
		registry.clone(),
		kernel,
		cel,
		log_config,
		&ready,
		drain_rx.clone(),
	);
	spawn_event_channel_server(config.clone(), registry, &ready, drain_rx);

	info!(
		ext_proc_addr = %config.ext_proc_addr,
		event_channel_addr = %config.event_channel_addr,
		gateway_id = %config.gateway_id,
		"policygate started"
	);

	Ok(Bound { shutdown, drain_tx })
}

fn spawn_ext_proc_server(
	config: Arc<control::config::Config>,
	registry: Arc<Registry>,
	kernel: Arc<Kernel>,
	cel: Arc<cel::Evaluator>,
	log_config: Arc<crate::telemetry::log::Config>,
	ready: &readiness::Ready,
	drain: drain::DrainWatcher,
) {
	let task = ready.register_task("ext_proc server");
	let addr = config.ext_proc_addr;
	tokio::spawn(async move {
		let service = ExternalProcessorServer::new(ExtProcService::new(registry, kernel, cel, log_config));
		let result = Server::builder()
			.add_service(service)
			.serve_with_shutdown(addr, async move {
				drain.wait_for_drain().await;
			})
			.await;
		drop(task);
		if let Err(err) = result {
			error!(%err, "ext_proc server exited with error");
		}
	});
}

fn spawn_event_channel_server(
	config: Arc<control::config::Config>,
	registry: Arc<Registry>,
	ready: &readiness::Ready,
	drain: drain::DrainWatcher,
) {
	let task = ready.register_task("event channel server");
	let addr = config.event_channel_addr;
	tokio::spawn(async move {
		let router = control::router(registry, config);
		let listener = match tokio::net::TcpListener::bind(addr).await {
			Ok(listener) => listener,
			Err(err) => {
				error!(%err, %addr, "failed to bind event channel listener");
				return;
			},
		};
		let result = axum::serve(listener, router)
			.with_graceful_shutdown(async move {
				drain.wait_for_drain().await;
			})
			.await;
		drop(task);
		if let Err(err) = result {
			error!(%err, "event channel server exited with error");
		}
	});
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: drain::DrainTrigger,
}

impl Bound {
	/// Waits for a shutdown signal, then drains in-flight requests before
	/// returning.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
		Ok(())
	}
}
