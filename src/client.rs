//! Bearer-injecting [`HttpClient`] decorator that refreshes once on token rejection.
//!
//! A single call moves through `token attached -> sent` and ends in success or failure. The
//! only loop is one refresh-and-retry cycle, entered when the first answer is an invalid-token
//! rejection; whatever the retried call returns is final.

// crates.io
use oauth2::http::{HeaderValue, Method, header::AUTHORIZATION};
// self
use crate::{
	_prelude::*,
	auth::{Credential, TokenSecret},
	cache::AccessTokenCache,
	classify,
	error::ConfigError,
	http::{Agent, HttpClient, HttpTransport, RequestOptions, Response, ResponseFuture},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
};

/// Retries granted to the refresh step (`maxRetries` of the bounded acquisition).
pub const DEFAULT_REFRESH_RETRIES: u32 = 3;

/// Per-client configuration bundle.
#[derive(Clone)]
pub struct ClientAuthState {
	/// Credential whose token is attached.
	pub credential: Credential,
	/// Transport attached to calls that do not supply one.
	pub agent: Option<Agent>,
	/// Retries granted to the refresh step.
	pub refresh_retries: u32,
}
impl ClientAuthState {
	/// Creates a bundle with no default agent and [`DEFAULT_REFRESH_RETRIES`].
	pub fn new(credential: Credential) -> Self {
		Self { credential, agent: None, refresh_retries: DEFAULT_REFRESH_RETRIES }
	}
}
impl Debug for ClientAuthState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ClientAuthState")
			.field("credential", &self.credential)
			.field("agent", &self.agent.is_some())
			.field("refresh_retries", &self.refresh_retries)
			.finish()
	}
}

/// Wraps an [`HttpClient`] so every verb carries a bearer token for one credential.
pub struct AuthorizedClient<C = dyn HttpClient, T = dyn HttpTransport>
where
	C: ?Sized,
	T: ?Sized,
{
	inner: Arc<C>,
	cache: Arc<AccessTokenCache<T>>,
	state: ClientAuthState,
}
impl<C, T> AuthorizedClient<C, T>
where
	C: ?Sized + HttpClient,
	T: ?Sized + HttpTransport,
{
	/// Decorates `inner` with tokens for `credential` served by `cache`.
	pub fn new(inner: Arc<C>, cache: Arc<AccessTokenCache<T>>, credential: Credential) -> Self {
		Self { inner, cache, state: ClientAuthState::new(credential) }
	}

	/// Attaches `agent` to calls that do not supply their own.
	pub fn with_agent(mut self, agent: Agent) -> Self {
		self.state.agent = Some(agent);

		self
	}

	/// Overrides the retries granted to the refresh step.
	pub fn with_refresh_retries(mut self, retries: u32) -> Self {
		self.state.refresh_retries = retries;

		self
	}

	/// Current configuration bundle.
	pub fn state(&self) -> &ClientAuthState {
		&self.state
	}

	/// Wrapped client.
	pub fn inner(&self) -> &Arc<C> {
		&self.inner
	}

	fn authorize(&self, options: &RequestOptions, token: &TokenSecret) -> Result<RequestOptions> {
		let mut options = options.clone();
		let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose()))
			.map_err(|_| ConfigError::InvalidHeaderValue { name: "authorization" })?;

		value.set_sensitive(true);
		// Existing values belong to other credentials in a composed call; keep them.
		options.headers.append(AUTHORIZATION, value);

		if options.agent.is_none() {
			options.agent = self.state.agent.clone();
		}

		Ok(options)
	}

	async fn send(&self, method: Method, url: Url, options: RequestOptions) -> Result<Response> {
		let credential = &self.state.credential;
		let token = self.cache.get_access_token(credential).await?;
		let first =
			self.inner.request(method.clone(), url.clone(), self.authorize(&options, &token)?).await;
		let rejected = match first {
			Ok(response) => return Ok(response),
			Err(e) if classify::is_invalid_access_token_error(&e) => e,
			Err(e) => return Err(e),
		};

		obs::log_refresh_retry(&credential.client_id, &rejected);

		let retries = self.state.refresh_retries;
		let token = match self.cache.refresh_access_token(credential, &token, retries).await {
			Ok(token) => token,
			Err(_) =>
				return Err(Error::RefreshExhausted {
					attempts: retries.saturating_add(1),
					source: Box::new(rejected),
				}),
		};

		self.inner.request(method, url, self.authorize(&options, &token)?).await
	}
}
impl<C, T> HttpClient for AuthorizedClient<C, T>
where
	C: ?Sized + HttpClient,
	T: ?Sized + HttpTransport,
{
	fn request(&self, method: Method, url: Url, options: RequestOptions) -> ResponseFuture<'_> {
		let span = FlowSpan::new(FlowKind::Request, "authorized_request");

		Box::pin(span.instrument(async move {
			obs::record_flow_outcome(FlowKind::Request, FlowOutcome::Attempt);

			obs::record_result(FlowKind::Request, self.send(method, url, options).await)
		}))
	}
}
impl<C, T> Debug for AuthorizedClient<C, T>
where
	C: ?Sized,
	T: ?Sized,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AuthorizedClient").field("state", &self.state).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use oauth2::http::HeaderMap;
	// self
	use super::*;
	use crate::{
		_preludet::*,
		acquire::{AcquireSettings, TokenAcquirer},
		config::CacheSettings,
		http::TransportClient,
	};

	const INVALID_TOKEN: &str = r#"{"error":"invalid_token","name":"ConstraintError"}"#;

	fn client(
		transport: ScriptedTransport,
	) -> (Arc<ScriptedTransport>, AuthorizedClient<TransportClient, ScriptedTransport>) {
		let transport = Arc::new(transport);
		let acquirer = TokenAcquirer::new(transport.clone(), AcquireSettings::default());
		let cache = Arc::new(AccessTokenCache::new(
			acquirer,
			Arc::new(ForgetfulStore),
			CacheSettings::default(),
		));
		let inner = Arc::new(TransportClient::new(transport.clone()));

		(transport, AuthorizedClient::new(inner, cache, test_credential()))
	}

	#[tokio::test]
	async fn attaches_a_bearer_token() {
		let (transport, client) = client(
			ScriptedTransport::new().token("78910").respond(Method::GET, "/resource", 200, "ok"),
		);
		let response = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect("Authorized call should succeed.");

		assert_eq!(response.text(), "ok");
		assert_eq!(
			transport.requests_to(Method::GET, "/resource")[0].authorization(),
			vec!["Bearer 78910"]
		);
	}

	#[tokio::test]
	async fn appends_to_an_existing_authorization_header() {
		let (transport, client) = client(
			ScriptedTransport::new().token("78910").respond(Method::POST, "/resource", 200, "ok"),
		);
		let mut headers = HeaderMap::new();

		headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer upstream"));

		client
			.post(test_url("/resource"), RequestOptions { headers, ..Default::default() })
			.await
			.expect("Authorized call should succeed.");

		assert_eq!(
			transport.requests_to(Method::POST, "/resource")[0].authorization(),
			vec!["Bearer upstream", "Bearer 78910"]
		);
	}

	#[tokio::test]
	async fn every_verb_is_intercepted() {
		let mut scripted = ScriptedTransport::new().token("78910");

		for method in [Method::PUT, Method::PATCH, Method::HEAD, Method::DELETE] {
			scripted = scripted.respond(method, "/resource", 204, "");
		}

		let (transport, client) = client(scripted);
		let url = test_url("/resource");

		client.put(url.clone(), RequestOptions::default()).await.expect("PUT should succeed.");
		client.patch(url.clone(), RequestOptions::default()).await.expect("PATCH should succeed.");
		client.head(url.clone(), RequestOptions::default()).await.expect("HEAD should succeed.");
		client.delete(url, RequestOptions::default()).await.expect("DELETE should succeed.");

		for method in [Method::PUT, Method::PATCH, Method::HEAD, Method::DELETE] {
			let sent = transport.requests_to(method, "/resource");

			assert_eq!(sent[0].authorization(), vec!["Bearer 78910"]);
		}

		assert_eq!(transport.calls(Method::POST, "/token"), 1);
	}

	#[tokio::test]
	async fn default_agent_is_attached_when_missing() {
		let (transport, client) = client(ScriptedTransport::new().token("78910"));
		let agent =
			Arc::new(ScriptedTransport::new().respond(Method::GET, "/resource", 200, "via agent"));
		let client = client.with_agent(agent.clone());
		let response = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect("Agent should answer.");

		assert_eq!(response.text(), "via agent");
		assert_eq!(agent.calls(Method::GET, "/resource"), 1);
		assert_eq!(transport.calls(Method::GET, "/resource"), 0);
	}

	#[tokio::test]
	async fn invalid_token_triggers_one_refresh_and_one_retry() {
		let (transport, client) = client(
			ScriptedTransport::new()
				.token("first")
				.token("second")
				.respond(Method::GET, "/resource", 401, INVALID_TOKEN)
				.respond(Method::GET, "/resource", 200, "ok"),
		);
		let response = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect("Retry with the refreshed token should succeed.");
		let sent = transport.requests_to(Method::GET, "/resource");

		assert_eq!(response.text(), "ok");
		assert_eq!(sent.len(), 2);
		assert_eq!(sent[0].authorization(), vec!["Bearer first"]);
		assert_eq!(sent[1].authorization(), vec!["Bearer second"]);
		assert_eq!(transport.calls(Method::POST, "/token"), 2);
	}

	#[tokio::test]
	async fn repeated_invalid_token_surfaces_the_second_rejection() {
		let (transport, client) = client(
			ScriptedTransport::new().token("78910").respond(
				Method::GET,
				"/resource",
				401,
				INVALID_TOKEN,
			),
		);
		let err = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect_err("Second rejection must be terminal.");

		assert_eq!(err.upstream().map(|upstream| upstream.status), Some(401));
		assert_eq!(transport.calls(Method::GET, "/resource"), 2);
		assert_eq!(transport.calls(Method::POST, "/token"), 2);
	}

	#[tokio::test]
	async fn other_failures_are_not_retried() {
		let (transport, client) = client(
			ScriptedTransport::new().token("78910").respond(
				Method::GET,
				"/resource",
				403,
				r#"{"error":"insufficient_scope"}"#,
			),
		);
		let err = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect_err("Forbidden must propagate.");

		assert_eq!(err.http_status(), Some(403));
		assert_eq!(transport.calls(Method::GET, "/resource"), 1);
		assert_eq!(transport.calls(Method::POST, "/token"), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn concurrent_rejections_share_one_refresh() {
		let (transport, client) = client(
			ScriptedTransport::new()
				.with_latency(Duration::from_millis(50))
				.token("first")
				.token("second")
				.respond(Method::GET, "/resource", 401, INVALID_TOKEN),
		);
		let url = test_url("/resource");
		let results = tokio::join!(
			client.get(url.clone(), RequestOptions::default()),
			client.get(url.clone(), RequestOptions::default()),
			client.get(url.clone(), RequestOptions::default()),
			client.get(url, RequestOptions::default()),
		);

		for result in [results.0, results.1, results.2, results.3] {
			let err = result.expect_err("Every retried call is rejected again.");

			assert_eq!(err.http_status(), Some(401));
		}

		assert_eq!(transport.calls(Method::POST, "/token"), 2);
		assert_eq!(transport.calls(Method::GET, "/resource"), 8);

		for sent in transport.requests_to(Method::GET, "/resource")[4..].iter() {
			assert_eq!(sent.authorization(), vec!["Bearer second"]);
		}
	}

	#[tokio::test]
	async fn failed_refresh_wraps_the_original_rejection() {
		let (transport, client) = client(
			ScriptedTransport::new()
				.token("78910")
				.respond(Method::POST, "/token", 500, "{}")
				.respond(Method::GET, "/resource", 401, INVALID_TOKEN),
		);
		let err = client
			.get(test_url("/resource"), RequestOptions::default())
			.await
			.expect_err("Refresh failure must surface.");

		match &err {
			Error::RefreshExhausted { attempts, source } => {
				assert_eq!(*attempts, 4);
				assert_eq!(source.upstream().map(|upstream| upstream.status), Some(401));
			},
			other => panic!("Unexpected error: {other:?}"),
		}

		assert_eq!(transport.calls(Method::GET, "/resource"), 1);
		assert_eq!(transport.calls(Method::POST, "/token"), 5);
	}
}
