//! The per-request/response contexts passed to policies, and the
//! read-only header abstraction that guards the kernel's mutation-fold
//! step from direct policy access.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value;

/// Case-insensitive, append-ordered header storage. Policies only ever see
/// this type through [`Headers::get`]/[`Headers::get_all`]/[`Headers::has`]/
/// [`Headers::iter`], all of which return owned copies — mutation happens
/// exclusively through the kernel's mutation-fold step via
/// [`Headers::apply_request_mutations`]/[`Headers::apply_response_mutations`].
#[derive(Debug, Clone, Default)]
pub struct Headers(http::HeaderMap<HeaderValue>);

impl Headers {
	pub fn new() -> Self {
		Self(http::HeaderMap::new())
	}

	pub fn from_http(map: http::HeaderMap<HeaderValue>) -> Self {
		Self(map)
	}

	/// Returns a defensive copy of every value for `name`, or `None` if the
	/// header is absent. Mutating the returned `Vec` never affects the next
	/// call (the "defensive copy" invariant in the spec).
	pub fn get(&self, name: &str) -> Option<Vec<String>> {
		let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
			return None;
		};
		let mut values: Vec<String> = self
			.0
			.get_all(&name)
			.iter()
			.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
			.collect();
		if values.is_empty() {
			None
		} else {
			values.shrink_to_fit();
			Some(values)
		}
	}

	pub fn get_first(&self, name: &str) -> Option<String> {
		self.get(name).and_then(|mut v| {
			if v.is_empty() {
				None
			} else {
				Some(v.remove(0))
			}
		})
	}

	pub fn has(&self, name: &str) -> bool {
		HeaderName::from_bytes(name.as_bytes())
			.map(|n| self.0.contains_key(n))
			.unwrap_or(false)
	}

	/// A deep copy of every header as a `name -> values` map.
	pub fn get_all(&self) -> HashMap<String, Vec<String>> {
		let mut out: HashMap<String, Vec<String>> = HashMap::new();
		for (name, value) in self.0.iter() {
			out
				.entry(name.as_str().to_ascii_lowercase())
				.or_default()
				.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
		}
		out
	}

	/// Invokes `f` once per header with defensive copies; `f` cannot affect
	/// this `Headers` instance.
	pub fn iter(&self, mut f: impl FnMut(&str, &str)) {
		for (name, value) in self.0.iter() {
			f(name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
		}
	}

	/// Reserved for the kernel's mutation-fold step.
	pub fn inner_mut(&mut self) -> &mut http::HeaderMap<HeaderValue> {
		&mut self.0
	}

	pub fn inner(&self) -> &http::HeaderMap<HeaderValue> {
		&self.0
	}

	pub fn apply_set(&mut self, name: &str, value: &str) -> Result<(), MutationError> {
		let name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| MutationError::InvalidHeaderName(name.to_string()))?;
		let value = HeaderValue::from_str(value)
			.map_err(|_| MutationError::InvalidHeaderValue(value.to_string()))?;
		self.0.remove(&name);
		self.0.insert(name, value);
		Ok(())
	}

	pub fn apply_append(&mut self, name: &str, value: &str) -> Result<(), MutationError> {
		let name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| MutationError::InvalidHeaderName(name.to_string()))?;
		let value = HeaderValue::from_str(value)
			.map_err(|_| MutationError::InvalidHeaderValue(value.to_string()))?;
		self.0.append(name, value);
		Ok(())
	}

	pub fn apply_remove(&mut self, name: &str) {
		if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
			self.0.remove(name);
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
	#[error("invalid header name: {0}")]
	InvalidHeaderName(String),
	#[error("invalid header value: {0}")]
	InvalidHeaderValue(String),
}

/// `{apiId, apiName, apiVersion, apiContext}` — the route identity quadruple
/// the upstream proxy has already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiIdentity {
	pub api_id: String,
	pub api_name: String,
	pub api_version: String,
	pub api_context: String,
}

/// Body content plus streaming flags, as carried by a single phase frame.
#[derive(Debug, Clone, Default)]
pub struct BodyState {
	pub content: Bytes,
	pub present: bool,
	pub end_of_stream: bool,
}

impl BodyState {
	pub fn replace(&mut self, content: Bytes) {
		self.content = content;
		self.present = true;
		self.end_of_stream = true;
	}
}

/// Per-request, per-phase mutable view. Owned by the kernel; policies only
/// read through [`Headers`] accessors and the plain fields below.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub method: Method,
	pub path: String,
	pub headers: Headers,
	pub body: BodyState,
	pub metadata: HashMap<String, Value>,
	pub route_name: String,
	pub api: ApiIdentity,
}

impl RequestContext {
	pub fn new(method: Method, path: String, headers: Headers, route_name: String) -> Self {
		Self {
			method,
			path,
			headers,
			body: BodyState::default(),
			metadata: HashMap::new(),
			route_name,
			api: ApiIdentity::default(),
		}
	}
}

/// Like [`RequestContext`] but for the response phase; retains the
/// request-side fields so response-phase policies (e.g. cost extractors)
/// can correlate request and response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
	pub request: RequestContext,
	pub response_headers: Headers,
	pub response_body: BodyState,
	pub response_status: StatusCode,
}

impl ResponseContext {
	pub fn new(request: RequestContext, response_headers: Headers, response_status: StatusCode) -> Self {
		Self {
			request,
			response_headers,
			response_body: BodyState::default(),
			response_status,
		}
	}
}

/// Produced by a request policy to short-circuit the chain.
#[derive(Debug, Clone)]
pub struct ImmediateResponse {
	pub status_code: StatusCode,
	/// Header names are normalized to lowercase.
	pub headers: Vec<(String, String)>,
	pub body: Bytes,
}

impl ImmediateResponse {
	pub fn new(status_code: StatusCode, body: impl Into<Bytes>) -> Self {
		Self {
			status_code,
			headers: Vec::new(),
			body: body.into(),
		}
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into().to_ascii_lowercase(), value.into()));
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
	Set,
	Append,
	Delete,
}

/// A single header edit instruction as configured on `modify-headers`.
#[derive(Debug, Clone)]
pub struct HeaderEdit {
	pub action: HeaderAction,
	pub name: String,
	pub value: Option<String>,
}

/// Mutation record returned by a request-phase policy. `body: None` means
/// "no change"; `Some(Bytes::new())` clears the body. `header_edits` is
/// applied one edit at a time, in the order a policy appended them, so two
/// edits touching the same header name resolve in configuration order
/// rather than a fixed set/remove/append precedence.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequestModifications {
	pub header_edits: Vec<HeaderEdit>,
	pub body: Option<Bytes>,
	pub path: Option<String>,
	pub method: Option<Method>,
}

/// Mutation record returned by a response-phase policy.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponseModifications {
	pub header_edits: Vec<HeaderEdit>,
	pub body: Option<Bytes>,
	pub status_code: Option<StatusCode>,
}

fn apply_header_edit(headers: &mut Headers, edit: HeaderEdit) -> Result<(), MutationError> {
	match edit.action {
		HeaderAction::Set => headers.apply_set(&edit.name, &edit.value.unwrap_or_default())?,
		HeaderAction::Append => headers.apply_append(&edit.name, &edit.value.unwrap_or_default())?,
		HeaderAction::Delete => headers.apply_remove(&edit.name),
	}
	Ok(())
}

impl UpstreamRequestModifications {
	pub fn fold_into(self, ctx: &mut RequestContext) -> Result<(), MutationError> {
		for edit in self.header_edits {
			apply_header_edit(&mut ctx.headers, edit)?;
		}
		if let Some(body) = self.body {
			ctx.body.replace(body);
		}
		if let Some(path) = self.path {
			ctx.path = path;
		}
		if let Some(method) = self.method {
			ctx.method = method;
		}
		Ok(())
	}
}

impl UpstreamResponseModifications {
	pub fn fold_into(self, ctx: &mut ResponseContext) -> Result<(), MutationError> {
		for edit in self.header_edits {
			apply_header_edit(&mut ctx.response_headers, edit)?;
		}
		if let Some(body) = self.body {
			ctx.response_body.replace(body);
		}
		if let Some(status) = self.status_code {
			ctx.response_status = status;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with(pairs: &[(&str, &str)]) -> Headers {
		let mut h = Headers::new();
		for (k, v) in pairs {
			h.apply_append(k, v).unwrap();
		}
		h
	}

	#[test]
	fn header_case_insensitivity() {
		let h = headers_with(&[("X-Foo", "bar")]);
		assert_eq!(h.get("x-foo"), h.get("X-FOO"));
		assert_eq!(h.get("x-foo"), Some(vec!["bar".to_string()]));
	}

	#[test]
	fn defensive_copy_does_not_alias() {
		let h = headers_with(&[("x-foo", "bar")]);
		let mut v = h.get("x-foo").unwrap();
		v.push("mutated".to_string());
		assert_eq!(h.get("x-foo"), Some(vec!["bar".to_string()]));
	}

	#[test]
	fn remove_then_append_yields_only_appended_values() {
		let mut h = headers_with(&[("x-a", "1")]);
		h.apply_remove("x-a");
		h.apply_append("x-a", "2").unwrap();
		assert_eq!(h.get("x-a"), Some(vec!["2".to_string()]));
	}

	#[test]
	fn set_is_idempotent() {
		let mut h = headers_with(&[]);
		let m = UpstreamRequestModifications {
			header_edits: vec![HeaderEdit {
				action: HeaderAction::Set,
				name: "x-a".into(),
				value: Some("1".into()),
			}],
			..Default::default()
		};
		let mut ctx = RequestContext::new(Method::GET, "/".into(), h.clone(), "r".into());
		m.clone().fold_into(&mut ctx).unwrap();
		let once = ctx.headers.get("x-a").unwrap();
		m.fold_into(&mut ctx).unwrap();
		let twice = ctx.headers.get("x-a").unwrap();
		assert_eq!(once, twice);
		h.apply_set("x-a", "1").unwrap();
	}
}
