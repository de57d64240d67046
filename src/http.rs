//! HTTP transport primitives for token exchanges and protected-resource calls.
//!
//! Two layers live here. [`HttpTransport`] is the narrow contract the broker depends on: it
//! executes one fully built [`HttpRequest`] and hands back the raw [`HttpResponse`]. On top of
//! it, [`HttpClient`] exposes the verb interface (`get`, `post`, `put`, `patch`, `head`,
//! `delete`) that [`AuthorizedClient`](crate::client::AuthorizedClient) decorates.

// std
use std::ops::Deref;
// crates.io
use oauth2::{
	HttpRequest, HttpResponse,
	http::{HeaderMap, Method, StatusCode},
};
// self
use crate::{
	_prelude::*,
	error::{ConfigError, TransportError, UpstreamError},
};

/// Boxed future returned by [`HttpTransport::execute`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + 'a + Send>>;

/// Boxed future returned by [`HttpClient`] verbs.
pub type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + 'a + Send>>;

/// Shared transport handle; the analogue of a TLS-configured connection agent.
pub type Agent = Arc<dyn HttpTransport>;

/// The broker's only dependency on an HTTP stack.
///
/// Implementations must be `Send + Sync + 'static` so a single transport can be shared by the
/// cache, the acquirer, and every authorized client. Any answer that reached the wire, including
/// non-2xx statuses, is returned as `Ok`; only failures to obtain an answer are errors.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Executes one request.
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_>;
}

/// Executes `request`, failing with [`TransportError::Timeout`] when `timeout` elapses first.
pub async fn execute_with_timeout<T>(
	transport: &T,
	request: HttpRequest,
	timeout: Option<Duration>,
) -> Result<HttpResponse, TransportError>
where
	T: ?Sized + HttpTransport,
{
	match timeout {
		Some(after) => tokio::time::timeout(after, transport.execute(request))
			.await
			.map_err(|_| TransportError::Timeout { after })?,
		None => transport.execute(request).await,
	}
}

/// Builds an [`HttpRequest`] from its parts.
pub fn build_request(
	method: Method,
	url: &Url,
	headers: HeaderMap,
	body: Vec<u8>,
) -> Result<HttpRequest, ConfigError> {
	let mut request = oauth2::http::Request::builder().method(method).uri(url.as_str()).body(body)?;

	*request.headers_mut() = headers;

	Ok(request)
}

/// Per-call options accepted by [`HttpClient`] verbs.
#[derive(Clone, Default)]
pub struct RequestOptions {
	/// Headers sent with the request.
	pub headers: HeaderMap,
	/// Optional raw body.
	pub body: Option<Vec<u8>>,
	/// Per-call timeout overriding the client default.
	pub timeout: Option<Duration>,
	/// Transport overriding the client default.
	pub agent: Option<Agent>,
}
impl RequestOptions {
	/// Sets the request body.
	pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
		self.body = Some(body.into());

		self
	}

	/// Sets the per-call timeout.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Sets the transport used for this call.
	pub fn with_agent(mut self, agent: Agent) -> Self {
		self.agent = Some(agent);

		self
	}
}
impl Debug for RequestOptions {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestOptions")
			.field("headers", &self.headers.keys().collect::<Vec<_>>())
			.field("body_len", &self.body.as_ref().map(Vec::len))
			.field("timeout", &self.timeout)
			.field("agent", &self.agent.is_some())
			.finish()
	}
}

/// Successful (2xx) answer returned by an [`HttpClient`].
#[derive(Clone, Debug)]
pub struct Response {
	/// HTTP status.
	pub status: StatusCode,
	/// Response headers.
	pub headers: HeaderMap,
	/// Raw body.
	pub data: Vec<u8>,
}
impl Response {
	/// Decodes the body as JSON.
	pub fn json<T>(&self) -> Result<T, serde_json::Error>
	where
		T: for<'de> Deserialize<'de>,
	{
		serde_json::from_slice(&self.data)
	}

	/// Body decoded as UTF-8 (lossy).
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.data).into_owned()
	}
}
impl From<HttpResponse> for Response {
	fn from(response: HttpResponse) -> Self {
		let (parts, data) = response.into_parts();

		Self { status: parts.status, headers: parts.headers, data }
	}
}

/// Verb interface over a transport; non-2xx answers fail with [`UpstreamError`].
///
/// Only [`HttpClient::request`] is required. Decorators override it once and every verb is
/// intercepted.
pub trait HttpClient
where
	Self: Send + Sync,
{
	/// Sends a request with an arbitrary method.
	fn request(&self, method: Method, url: Url, options: RequestOptions) -> ResponseFuture<'_>;

	/// Sends a `GET` request.
	fn get(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::GET, url, options)
	}

	/// Sends a `POST` request.
	fn post(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::POST, url, options)
	}

	/// Sends a `PUT` request.
	fn put(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::PUT, url, options)
	}

	/// Sends a `PATCH` request.
	fn patch(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::PATCH, url, options)
	}

	/// Sends a `HEAD` request.
	fn head(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::HEAD, url, options)
	}

	/// Sends a `DELETE` request.
	fn delete(&self, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		self.request(Method::DELETE, url, options)
	}
}

/// Plain [`HttpClient`] executing calls through an [`Agent`].
#[derive(Clone)]
pub struct TransportClient {
	agent: Agent,
	timeout: Option<Duration>,
}
impl TransportClient {
	/// Creates a client that uses `agent` unless a call supplies its own.
	pub fn new(agent: Agent) -> Self {
		Self { agent, timeout: None }
	}

	/// Applies `timeout` to calls that do not set one.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);

		self
	}

	/// Default agent.
	pub fn agent(&self) -> &Agent {
		&self.agent
	}
}
impl Debug for TransportClient {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TransportClient").field("timeout", &self.timeout).finish_non_exhaustive()
	}
}
impl HttpClient for TransportClient {
	fn request(&self, method: Method, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		Box::pin(async move {
			let RequestOptions { headers, body, timeout, agent } = options;
			let agent = agent.unwrap_or_else(|| self.agent.clone());
			let request = build_request(method, &url, headers, body.unwrap_or_default())?;
			let response =
				execute_with_timeout(agent.as_ref(), request, timeout.or(self.timeout)).await?;
			let status = response.status();

			if !status.is_success() {
				return Err(UpstreamError::from_body(status.as_u16(), response.body()).into());
			}

			Ok(Response::from(response))
		})
	}
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one place.
/// Token requests should not follow redirects, matching OAuth 2.0 guidance that token
/// endpoints return results directly instead of delegating to another URI.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct ReqwestHttpClient(pub ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
	/// Builds a rustls-backed client that never follows redirects.
	pub fn new() -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder().redirect(reqwest::redirect::Policy::none()).build()?;

		Ok(Self(client))
	}

	/// Wraps an existing reqwest [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}
}
#[cfg(feature = "reqwest")]
impl AsRef<ReqwestClient> for ReqwestHttpClient {
	fn as_ref(&self) -> &ReqwestClient {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl Deref for ReqwestHttpClient {
	type Target = ReqwestClient;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestHttpClient {
	fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let response = self.0.execute(request.try_into()?).await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let mut response_new = HttpResponse::new(response.bytes().await?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::*;

	#[tokio::test]
	async fn transport_client_maps_non_success_to_upstream_error() {
		let transport = Arc::new(ScriptedTransport::new().respond(
			Method::GET,
			"/resource",
			401,
			r#"{"error":"invalid_token"}"#,
		));
		let client = TransportClient::new(transport.clone());
		let err = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect_err("A 401 answer must fail.");
		let upstream = err.upstream().expect("Failure should carry the upstream answer.");

		assert_eq!(upstream.status, 401);
		assert_eq!(upstream.error_code(), Some("invalid_token"));
		assert_eq!(transport.calls(Method::GET, "/resource"), 1);
	}

	#[tokio::test]
	async fn per_call_agent_overrides_the_default() {
		let default = Arc::new(ScriptedTransport::new());
		let override_agent =
			Arc::new(ScriptedTransport::new().respond(Method::PUT, "/resource", 200, "ok"));
		let client = TransportClient::new(default.clone());
		let response = client
			.put(test_url("/resource"), RequestOptions::default().with_agent(override_agent.clone()))
			.await
			.expect("Override agent should answer.");

		assert_eq!(response.text(), "ok");
		assert_eq!(default.calls(Method::PUT, "/resource"), 0);
		assert_eq!(override_agent.calls(Method::PUT, "/resource"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn elapsed_timeout_becomes_a_transport_error() {
		let transport = ScriptedTransport::new()
			.with_latency(Duration::from_secs(10))
			.respond(Method::GET, "/slow", 200, "late");
		let request =
			build_request(Method::GET, &test_url("/slow"), HeaderMap::new(), Vec::new())
				.expect("Request should build.");
		let err = execute_with_timeout(&transport, request, Some(Duration::from_secs(1)))
			.await
			.expect_err("Slow answer must time out.");

		assert!(matches!(err, TransportError::Timeout { .. }));
	}
}
