//! gRPC transport adapter: implements the `ExternalProcessor` service
//! generated from `proto/ext_proc.proto` and drives the [`Kernel`] from its
//! bidirectional frame stream.

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod proto {
	tonic::include_proto!("policygate.extproc.v1");
}

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use self::proto::body_mutation::Mutation as WireBodyMutation;
use self::proto::external_processor_server::ExternalProcessor;
use self::proto::processing_request::Request as WireRequest;
use self::proto::processing_response::Response as WireResponse;
use self::proto::{
	BodyMutation, BodyResponse, CommonResponse, HeaderMap as WireHeaderMap, HeaderMutation,
	HeaderValue as WireHeaderValue, HeaderValueOption, HeadersResponse, HttpBody, HttpHeaders,
	ImmediateResponse as WireImmediateResponse, ProcessingRequest, ProcessingResponse,
};
use crate::cel;
use crate::context::{ApiIdentity, BodyState, Headers, ImmediateResponse, RequestContext, ResponseContext};
use crate::policy::kernel::{self, Kernel};
use crate::policy::registry::{Error as RegistryError, Registry};
use crate::policy::ResolvedChain;
use crate::telemetry::log as telemetry_log;

const OUTBOUND_BUFFER: usize = 16;
const STATUS_PSEUDO_HEADER: &str = ":status";

pub struct ExtProcService {
	registry: Arc<Registry>,
	kernel: Arc<Kernel>,
	cel: Arc<cel::Evaluator>,
	log_config: Arc<telemetry_log::Config>,
}

impl ExtProcService {
	pub fn new(
		registry: Arc<Registry>,
		kernel: Arc<Kernel>,
		cel: Arc<cel::Evaluator>,
		log_config: Arc<telemetry_log::Config>,
	) -> Self {
		Self {
			registry,
			kernel,
			cel,
			log_config,
		}
	}
}

type ResponseStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<ProcessingResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
	type ProcessStream = ResponseStream;

	async fn process(
		&self,
		request: Request<Streaming<ProcessingRequest>>,
	) -> Result<Response<Self::ProcessStream>, Status> {
		let mut inbound = request.into_inner();
		let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
		let mut exchange = Exchange::new(
			self.registry.clone(),
			self.kernel.clone(),
			self.cel.clone(),
			self.log_config.clone(),
		);

		tokio::spawn(async move {
			while let Some(frame) = inbound.next().await {
				let frame = match frame {
					Ok(frame) => frame,
					Err(err) => {
						tracing::warn!(%err, "ext_proc stream read error");
						break;
					},
				};
				let Some(response) = exchange.handle(frame) else {
					continue;
				};
				if tx.send(Ok(response)).await.is_err() {
					break;
				}
			}
		});

		Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
	}
}

/// Per-stream state machine: one [`Exchange`] is created per `Process` call
/// and lives for exactly one HTTP interaction, with one frame exchanged per
/// phase. The chain resolved at request-headers time is carried unchanged
/// into the response phase, so an in-flight exchange keeps the chain
/// snapshot it started with even if the registry is updated mid-flight.
struct Exchange {
	registry: Arc<Registry>,
	kernel: Arc<Kernel>,
	cel: Arc<cel::Evaluator>,
	log_config: Arc<telemetry_log::Config>,
	phase: Phase,
}

enum Phase {
	AwaitRequestHeaders,
	AwaitRequestBody {
		ctx: RequestContext,
		chain: Option<ResolvedChain>,
	},
	AwaitResponseHeaders {
		request: RequestContext,
		chain: Option<ResolvedChain>,
	},
	AwaitResponseBody {
		ctx: ResponseContext,
		chain: Option<ResolvedChain>,
	},
	Done,
}

impl Exchange {
	fn new(registry: Arc<Registry>, kernel: Arc<Kernel>, cel: Arc<cel::Evaluator>, log_config: Arc<telemetry_log::Config>) -> Self {
		Self {
			registry,
			kernel,
			cel,
			log_config,
			phase: Phase::AwaitRequestHeaders,
		}
	}

	fn handle(&mut self, frame: ProcessingRequest) -> Option<ProcessingResponse> {
		match frame.request? {
			WireRequest::RequestHeaders(h) => Some(self.on_request_headers(h)),
			WireRequest::RequestBody(b) => self.on_request_body(b),
			WireRequest::ResponseHeaders(h) => Some(self.on_response_headers(h)),
			WireRequest::ResponseBody(b) => self.on_response_body(b),
			WireRequest::RequestTrailers(_) | WireRequest::ResponseTrailers(_) => None,
		}
	}

	fn on_request_headers(&mut self, h: HttpHeaders) -> ProcessingResponse {
		let method = Method::from_bytes(h.method.as_bytes()).unwrap_or(Method::GET);
		let mut ctx = RequestContext::new(method, h.path, headers_from_wire(h.headers), h.route_key.clone());
		ctx.api = ApiIdentity {
			api_id: h.api_id,
			api_name: h.api_name,
			api_version: h.api_version,
			api_context: h.api_context,
		};

		let chain = self.resolve_chain(&h.route_key);

		if !h.end_of_stream {
			self.phase = Phase::AwaitRequestBody { ctx, chain };
			return headers_response(CommonResponse::default());
		}

		self.run_request_phase(ctx, chain, false)
	}

	fn on_request_body(&mut self, b: HttpBody) -> Option<ProcessingResponse> {
		let Phase::AwaitRequestBody { mut ctx, chain } = std::mem::replace(&mut self.phase, Phase::Done) else {
			tracing::warn!("request body frame received out of order, ignoring");
			return None;
		};
		ctx.body = BodyState {
			content: Bytes::from(b.body),
			present: true,
			end_of_stream: b.end_of_stream,
		};
		Some(self.run_request_phase(ctx, chain, true))
	}

	fn run_request_phase(&mut self, mut ctx: RequestContext, chain: Option<ResolvedChain>, as_body: bool) -> ProcessingResponse {
		let Some(chain) = chain else {
			self.phase = Phase::AwaitResponseHeaders { request: ctx, chain: None };
			return frame(as_body, CommonResponse::default());
		};

		let before_headers = ctx.headers.get_all();
		let before_body = ctx.body.content.clone();

		match self.kernel.execute_request_phase(&chain, &mut ctx) {
			Ok(run) => {
				for result in &run.results {
					telemetry_log::emit(&self.cel, &self.log_config, &ctx, None, result);
				}
				if run.short_circuited {
					self.phase = Phase::Done;
					return immediate_response(run.final_action.expect("short-circuited phase carries a response"));
				}
				let mutation = CommonResponse {
					header_mutation: Some(diff_headers(&before_headers, &ctx.headers)),
					body_mutation: diff_body(&before_body, &ctx.body),
				};
				self.phase = Phase::AwaitResponseHeaders {
					request: ctx,
					chain: Some(chain),
				};
				frame(as_body, mutation)
			},
			Err(err) => {
				if let kernel::Error::PolicyFatal { results, .. } = &err {
					for result in results {
						telemetry_log::emit(&self.cel, &self.log_config, &ctx, None, result);
					}
				}
				tracing::error!(%err, "request phase aborted");
				self.phase = Phase::Done;
				immediate_response(kernel_error_response(&err))
			},
		}
	}

	fn on_response_headers(&mut self, h: HttpHeaders) -> ProcessingResponse {
		let Phase::AwaitResponseHeaders { request, chain } = std::mem::replace(&mut self.phase, Phase::Done) else {
			tracing::warn!("response headers frame received out of order, ignoring");
			return headers_response(CommonResponse::default());
		};

		let headers = headers_from_wire(h.headers);
		let status = headers
			.get_first(STATUS_PSEUDO_HEADER)
			.and_then(|s| s.parse::<u16>().ok())
			.and_then(|code| StatusCode::from_u16(code).ok())
			.unwrap_or(StatusCode::OK);
		let ctx = ResponseContext::new(request, headers, status);

		if !h.end_of_stream {
			self.phase = Phase::AwaitResponseBody { ctx, chain };
			return headers_response(CommonResponse::default());
		}

		self.run_response_phase(ctx, chain, false)
	}

	fn on_response_body(&mut self, b: HttpBody) -> Option<ProcessingResponse> {
		let Phase::AwaitResponseBody { mut ctx, chain } = std::mem::replace(&mut self.phase, Phase::Done) else {
			tracing::warn!("response body frame received out of order, ignoring");
			return None;
		};
		ctx.response_body = BodyState {
			content: Bytes::from(b.body),
			present: true,
			end_of_stream: b.end_of_stream,
		};
		Some(self.run_response_phase(ctx, chain, true))
	}

	fn run_response_phase(&mut self, mut ctx: ResponseContext, chain: Option<ResolvedChain>, as_body: bool) -> ProcessingResponse {
		self.phase = Phase::Done;
		let Some(chain) = chain else {
			return frame(as_body, CommonResponse::default());
		};

		let before_headers = ctx.response_headers.get_all();
		let before_body = ctx.response_body.content.clone();

		match self.kernel.execute_response_phase(&chain, &mut ctx) {
			Ok(run) => {
				for result in &run.results {
					telemetry_log::emit(&self.cel, &self.log_config, &ctx.request, Some(&ctx), result);
				}
				frame(
					as_body,
					CommonResponse {
						header_mutation: Some(diff_headers(&before_headers, &ctx.response_headers)),
						body_mutation: diff_body(&before_body, &ctx.response_body),
					},
				)
			},
			Err(err) => {
				if let kernel::Error::PolicyFatal { results, .. } = &err {
					for result in results {
						telemetry_log::emit(&self.cel, &self.log_config, &ctx.request, Some(&ctx), result);
					}
				}
				tracing::error!(%err, "response phase aborted");
				immediate_response(kernel_error_response(&err))
			},
		}
	}

	fn resolve_chain(&self, route_key: &str) -> Option<ResolvedChain> {
		match self.registry.resolve_chain(route_key) {
			Ok(chain) => Some(chain),
			Err(RegistryError::UnknownRoute(_)) => None,
			Err(err) => {
				tracing::warn!(%err, route_key, "chain resolution failed unexpectedly");
				None
			},
		}
	}
}

fn headers_from_wire(map: Option<WireHeaderMap>) -> Headers {
	let mut headers = Headers::new();
	if let Some(map) = map {
		for h in map.headers {
			let value = String::from_utf8_lossy(&h.raw_value).into_owned();
			let _ = headers.apply_append(&h.key, &value);
		}
	}
	headers
}

fn wire_header_value_option(name: &str, value: &str) -> HeaderValueOption {
	HeaderValueOption {
		header: Some(WireHeaderValue {
			key: name.to_string(),
			raw_value: value.as_bytes().to_vec(),
		}),
	}
}

/// A per-name, per-value diff of the header map as it stood before and
/// after kernel execution: every header whose final values differ from the
/// pre-phase snapshot is emitted as a `set`, and every header present
/// before but absent after is emitted as a `remove`. This expresses the
/// state diff the wire protocol wants rather than a replay of the
/// individual edits that produced it.
fn diff_headers(before: &HashMap<String, Vec<String>>, after: &Headers) -> HeaderMutation {
	let after_map = after.get_all();
	let mut set_headers = Vec::new();
	for (name, values) in &after_map {
		if before.get(name) != Some(values) {
			for value in values {
				set_headers.push(wire_header_value_option(name, value));
			}
		}
	}
	let remove_headers = before
		.keys()
		.filter(|name| !after_map.contains_key(*name))
		.cloned()
		.collect();
	HeaderMutation {
		set_headers,
		remove_headers,
	}
}

fn diff_body(before: &Bytes, after: &BodyState) -> Option<BodyMutation> {
	if !after.present {
		return None;
	}
	if after.content.is_empty() && !before.is_empty() {
		return Some(BodyMutation {
			mutation: Some(WireBodyMutation::ClearBody(true)),
		});
	}
	if &after.content != before {
		return Some(BodyMutation {
			mutation: Some(WireBodyMutation::Body(after.content.to_vec())),
		});
	}
	None
}

fn headers_response(response: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(WireResponse::RequestHeaders(HeadersResponse {
			response: Some(response),
		})),
	}
}

fn body_response(response: CommonResponse) -> ProcessingResponse {
	ProcessingResponse {
		response: Some(WireResponse::RequestBody(BodyResponse {
			response: Some(response),
		})),
	}
}

fn frame(as_body: bool, response: CommonResponse) -> ProcessingResponse {
	if as_body {
		body_response(response)
	} else {
		headers_response(response)
	}
}

fn immediate_response(resp: ImmediateResponse) -> ProcessingResponse {
	let set_headers = resp
		.headers
		.iter()
		.map(|(name, value)| wire_header_value_option(name, value))
		.collect();
	ProcessingResponse {
		response: Some(WireResponse::ImmediateResponse(WireImmediateResponse {
			status: resp.status_code.as_u16() as u32,
			headers: Some(HeaderMutation {
				set_headers,
				remove_headers: Vec::new(),
			}),
			body: resp.body.to_vec(),
			details: String::new(),
		})),
	}
}

fn kernel_error_response(err: &kernel::Error) -> ImmediateResponse {
	ImmediateResponse::new(StatusCode::INTERNAL_SERVER_ERROR, Bytes::from(err.to_string()))
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::cel;
	use crate::policy::registry::Registry;
	use crate::policy::{PolicySpec, RouteChain};
	use crate::policies;
	use crate::ratelimit::store::InMemoryStore;

	fn registry_with_respond_chain(route_key: &str) -> (Arc<Registry>, Arc<Kernel>, Arc<cel::Evaluator>) {
		let cel = Arc::new(cel::Evaluator::new());
		let registry = Arc::new(Registry::new(cel.clone()));
		policies::register_builtins(&registry, Arc::new(InMemoryStore::new()), cel.clone()).unwrap();
		registry
			.apply_snapshot(vec![RouteChain {
				route_key: route_key.to_string(),
				specs: vec![PolicySpec {
					name: "respond".to_string(),
					version: 1,
					enabled: true,
					parameters: serde_json::json!({"statusCode": 201}),
					execution_condition: None,
				}],
			}])
			.unwrap();
		let kernel = Arc::new(Kernel::new(cel.clone()));
		(registry, kernel, cel)
	}

	fn exchange(registry: Arc<Registry>, kernel: Arc<Kernel>, cel: Arc<cel::Evaluator>) -> Exchange {
		Exchange::new(registry, kernel, cel, Arc::new(telemetry_log::Config::default()))
	}

	fn headers_frame(route_key: &str, end_of_stream: bool) -> ProcessingRequest {
		ProcessingRequest {
			request: Some(WireRequest::RequestHeaders(HttpHeaders {
				headers: Some(WireHeaderMap { headers: vec![] }),
				end_of_stream,
				method: "GET".to_string(),
				path: "/widgets".to_string(),
				route_key: route_key.to_string(),
				api_id: "api-1".to_string(),
				api_name: "widgets".to_string(),
				api_version: "v1".to_string(),
				api_context: "".to_string(),
			})),
		}
	}

	#[test]
	fn unknown_route_bypasses_with_no_mutation() {
		let (registry, kernel, cel) = registry_with_respond_chain("configured-route");
		let mut exchange = exchange(registry, kernel, cel);
		let response = exchange.handle(headers_frame("other-route", true)).unwrap();
		match response.response.unwrap() {
			WireResponse::RequestHeaders(HeadersResponse { response: Some(cr) }) => {
				assert!(cr.header_mutation.unwrap().set_headers.is_empty());
			},
			other => panic!("unexpected response: {other:?}"),
		}
	}

	#[test]
	fn configured_chain_short_circuits_with_immediate_response() {
		let (registry, kernel, cel) = registry_with_respond_chain("r1");
		let mut exchange = exchange(registry, kernel, cel);
		let response = exchange.handle(headers_frame("r1", true)).unwrap();
		match response.response.unwrap() {
			WireResponse::ImmediateResponse(resp) => assert_eq!(resp.status, 201),
			other => panic!("unexpected response: {other:?}"),
		}
	}

	#[test]
	fn request_body_frame_resumes_the_awaiting_phase() {
		let (registry, kernel, cel) = registry_with_respond_chain("r1");
		let mut exchange = exchange(registry, kernel, cel);
		assert!(matches!(
			exchange.handle(headers_frame("r1", false)).unwrap().response.unwrap(),
			WireResponse::RequestHeaders(_)
		));
		let body = ProcessingRequest {
			request: Some(WireRequest::RequestBody(HttpBody {
				body: b"hello".to_vec(),
				end_of_stream: true,
			})),
		};
		match exchange.handle(body).unwrap().response.unwrap() {
			WireResponse::ImmediateResponse(resp) => assert_eq!(resp.status, 201),
			other => panic!("unexpected response: {other:?}"),
		}
	}

	#[test]
	fn header_diff_reports_only_changed_and_removed_names() {
		let mut before = HashMap::new();
		before.insert("x-a".to_string(), vec!["1".to_string()]);
		before.insert("x-removed".to_string(), vec!["gone".to_string()]);

		let mut after = Headers::new();
		after.apply_append("x-a", "1").unwrap();
		after.apply_append("x-b", "2").unwrap();

		let mutation = diff_headers(&before, &after);
		assert_eq!(mutation.remove_headers, vec!["x-removed".to_string()]);
		assert_eq!(mutation.set_headers.len(), 1);
		assert_eq!(mutation.set_headers[0].header.as_ref().unwrap().key, "x-b");
	}

	#[test]
	fn body_diff_emits_clear_when_policy_empties_a_present_body() {
		let before = Bytes::from_static(b"original");
		let after = BodyState {
			content: Bytes::new(),
			present: true,
			end_of_stream: true,
		};
		let mutation = diff_body(&before, &after).unwrap();
		assert!(matches!(mutation.mutation, Some(WireBodyMutation::ClearBody(true))));
	}
}
