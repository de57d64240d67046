//! Client-credentials token acquisition with bounded and backoff retry modes.

pub mod backoff;

pub use backoff::BackoffPolicy;

// std
use std::sync::atomic::{AtomicU32, Ordering};
// crates.io
use backon::Retryable;
use oauth2::http::{
	HeaderMap, HeaderValue, Method,
	header::{ACCEPT, CONTENT_TYPE},
};
use url::form_urlencoded::Serializer as FormSerializer;
// self
use crate::{
	_prelude::*,
	auth::{Credential, TokenRecord, TokenSecret},
	classify,
	error::{TransientError, UpstreamError},
	http::{self, HttpTransport},
	lifecycle::FatalSignal,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::{self, DEFAULT_TOKEN_TTL},
};

/// Settings of the bounded acquisition mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireSettings {
	/// Retries after the first attempt.
	pub max_retries: u32,
	/// Timeout of each token endpoint call.
	pub request_timeout: Option<Duration>,
	/// Lifetime assigned to freshly acquired tokens.
	pub token_ttl: Duration,
}
impl Default for AcquireSettings {
	fn default() -> Self {
		Self {
			max_retries: 3,
			request_timeout: Some(Duration::from_secs(30)),
			token_ttl: DEFAULT_TOKEN_TTL,
		}
	}
}

#[derive(Deserialize)]
struct TokenResponse {
	#[serde(default)]
	access_token: Option<String>,
}

/// Performs the client-credentials exchange against a credential's token endpoint.
pub struct TokenAcquirer<T = dyn HttpTransport>
where
	T: ?Sized,
{
	transport: Arc<T>,
	settings: AcquireSettings,
}
impl<T> TokenAcquirer<T>
where
	T: ?Sized + HttpTransport,
{
	/// Creates an acquirer over `transport`.
	pub fn new(transport: Arc<T>, settings: AcquireSettings) -> Self {
		Self { transport, settings }
	}

	/// Transport used for token calls.
	pub fn transport(&self) -> &Arc<T> {
		&self.transport
	}

	/// Active settings.
	pub fn settings(&self) -> &AcquireSettings {
		&self.settings
	}

	/// Performs exactly one token request.
	///
	/// Non-2xx answers become [`UpstreamError`]; 2xx answers without a non-empty
	/// `access_token` become [`TransientError`].
	pub async fn request_token(&self, credential: &Credential) -> Result<TokenRecord> {
		let url = credential.token_url()?;
		let mut headers = HeaderMap::new();

		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
		headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

		let request =
			http::build_request(Method::POST, &url, headers, form_body(credential).into_bytes())?;
		let response =
			http::execute_with_timeout(self.transport.as_ref(), request, self.settings.request_timeout)
				.await?;
		let status = response.status();

		if !status.is_success() {
			return Err(UpstreamError::from_body(status.as_u16(), response.body()).into());
		}

		let status = Some(status.as_u16());
		let de = &mut serde_json::Deserializer::from_slice(response.body());
		let parsed: TokenResponse = serde_path_to_error::deserialize(de)
			.map_err(|e| TransientError::TokenResponseParse { source: Arc::new(e), status })?;
		let access_token = parsed.access_token.filter(|token| !token.is_empty()).ok_or_else(|| {
			TransientError::TokenEndpoint {
				message: "response did not include an access_token".into(),
				status,
			}
		})?;
		let issued_at = OffsetDateTime::now_utc();

		Ok(TokenRecord {
			client_id: credential.client_id.clone(),
			token_endpoint: credential.token_endpoint.clone(),
			access_token: TokenSecret::new(access_token),
			issued_at,
			expires_at: store::expiry_after(issued_at, self.settings.token_ttl)?,
		})
	}

	/// Bounded mode: up to `max_retries + 1` back-to-back attempts.
	///
	/// Every failed attempt is logged and the next one starts immediately. Exhaustion yields
	/// [`Error::ServiceUnavailable`] carrying the final failure.
	pub async fn acquire(&self, credential: &Credential, max_retries: u32) -> Result<TokenRecord> {
		credential.validate()?;

		let attempts = max_retries.saturating_add(1);
		let span = FlowSpan::new(FlowKind::Acquire, "acquire");

		span.instrument(async move {
			let mut last_error = None;

			for attempt in 1..=attempts {
				obs::record_flow_outcome(FlowKind::Acquire, FlowOutcome::Attempt);

				match self.request_token(credential).await {
					Ok(record) => {
						obs::record_flow_outcome(FlowKind::Acquire, FlowOutcome::Success);

						return Ok(record);
					},
					Err(e) => {
						obs::log_attempt_failure(
							FlowKind::Acquire,
							&credential.client_id,
							attempt,
							&e,
						);

						last_error = Some(e);
					},
				}
			}

			obs::record_flow_outcome(FlowKind::Acquire, FlowOutcome::Failure);

			Err(Error::ServiceUnavailable { attempts, last_error: last_error.map(Box::new) })
		})
		.await
	}

	/// Bounded mode using the configured retry count.
	pub async fn acquire_default(&self, credential: &Credential) -> Result<TokenRecord> {
		self.acquire(credential, self.settings.max_retries).await
	}

	/// Backoff mode used by startup warm-up.
	///
	/// Failures classified as unrecoverable fire `fatal` at once and return
	/// [`Error::Unrecoverable`]. Running out of attempts fires `fatal` as well. Credentials that
	/// fail validation never reach the network and count as unrecoverable.
	pub async fn acquire_with_backoff(
		&self,
		credential: &Credential,
		policy: &BackoffPolicy,
		fatal: &dyn FatalSignal,
	) -> Result<TokenRecord> {
		let span = FlowSpan::new(FlowKind::WarmUp, "acquire_with_backoff");

		span.instrument(async move {
			if let Err(e) = credential.validate() {
				let fatal_error = Error::Unrecoverable { source: Box::new(e.into()) };

				obs::record_flow_outcome(FlowKind::WarmUp, FlowOutcome::Failure);
				fatal.trigger(&fatal_error);

				return Err(fatal_error);
			}

			let counter = AtomicU32::new(0);
			let attempts = &counter;
			let attempt = move || async move {
				let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;

				obs::record_flow_outcome(FlowKind::WarmUp, FlowOutcome::Attempt);

				self.request_token(credential).await.inspect_err(|e| {
					obs::log_attempt_failure(FlowKind::WarmUp, &credential.client_id, attempt, e);
				})
			};
			let outcome = attempt
				.retry(policy.builder())
				.sleep(tokio::time::sleep)
				.when(|e: &Error| !classify::is_unrecoverable_error(e))
				.notify(|_: &Error, delay: Duration| {
					obs::log_backoff_delay(&credential.client_id, delay)
				})
				.await;
			let e = match outcome {
				Ok(record) => {
					obs::record_flow_outcome(FlowKind::WarmUp, FlowOutcome::Success);

					return Ok(record);
				},
				Err(e) => e,
			};
			let fatal_error = if classify::is_unrecoverable_error(&e) {
				Error::Unrecoverable { source: Box::new(e) }
			} else {
				Error::ServiceUnavailable {
					attempts: counter.load(Ordering::Relaxed),
					last_error: Some(Box::new(e)),
				}
			};

			obs::record_flow_outcome(FlowKind::WarmUp, FlowOutcome::Failure);
			fatal.trigger(&fatal_error);

			Err(fatal_error)
		})
		.await
	}
}
impl<T> Debug for TokenAcquirer<T>
where
	T: ?Sized,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenAcquirer").field("settings", &self.settings).finish_non_exhaustive()
	}
}

fn form_body(credential: &Credential) -> String {
	let mut form = FormSerializer::new(String::new());

	form.append_pair("grant_type", &credential.grant_type)
		.append_pair("client_id", &credential.client_id)
		.append_pair("client_secret", credential.client_secret.expose());

	if !credential.scope.is_empty() {
		form.append_pair("scope", &credential.scope.delimited());
	}
	if let Some(audience) = &credential.audience {
		form.append_pair("audience", audience);
	}

	form.finish()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		error::{ConfigError, ValidationError},
		lifecycle::FatalLatch,
	};

	fn acquirer(transport: &Arc<ScriptedTransport>) -> TokenAcquirer<ScriptedTransport> {
		TokenAcquirer::new(transport.clone(), AcquireSettings::default())
	}

	fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
		BackoffPolicy {
			max_attempts,
			min_delay: Duration::from_millis(10),
			max_delay: Duration::from_millis(40),
			factor: 2.0,
			jitter: false,
		}
	}

	#[tokio::test]
	async fn request_token_posts_the_client_credentials_form() {
		let transport = Arc::new(ScriptedTransport::new().token("78910"));
		let credential = test_credential().with_audience("meters");
		let record = acquirer(&transport)
			.request_token(&credential)
			.await
			.expect("Token request should succeed.");

		assert_eq!(record.access_token.expose(), "78910");
		assert_eq!(record.client_id, "123");
		assert_eq!(record.token_endpoint, "https://auth.test/token");

		let sent = transport.requests_to(Method::POST, "/token");
		let body = sent[0].body_text();

		assert_eq!(
			body,
			"grant_type=client_credentials&client_id=123&client_secret=456&scope=meter&audience=meters"
		);
		assert_eq!(
			sent[0].headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
			Some("application/x-www-form-urlencoded")
		);
	}

	#[tokio::test]
	async fn success_without_access_token_is_transient() {
		let transport = Arc::new(ScriptedTransport::new().respond(
			Method::POST,
			"/token",
			200,
			r#"{"token_type":"bearer"}"#,
		));
		let err = acquirer(&transport)
			.request_token(&test_credential())
			.await
			.expect_err("Missing access_token must fail.");

		assert!(matches!(err, Error::Transient(TransientError::TokenEndpoint { .. })));
	}

	#[tokio::test]
	async fn bounded_mode_succeeds_on_the_third_call() {
		let transport = Arc::new(
			ScriptedTransport::new()
				.respond(Method::POST, "/token", 500, "{}")
				.fail(Method::POST, "/token")
				.token("78910"),
		);
		let record = acquirer(&transport)
			.acquire(&test_credential(), 3)
			.await
			.expect("Third attempt should succeed.");

		assert_eq!(record.access_token.expose(), "78910");
		assert_eq!(transport.calls(Method::POST, "/token"), 3);
	}

	#[tokio::test]
	async fn bounded_mode_gives_up_after_max_retries_plus_one() {
		let transport =
			Arc::new(ScriptedTransport::new().respond(Method::POST, "/token", 500, "{}"));
		let err = acquirer(&transport)
			.acquire(&test_credential(), 3)
			.await
			.expect_err("Always failing endpoint must exhaust.");

		assert!(matches!(err, Error::ServiceUnavailable { attempts: 4, last_error: Some(_) }));
		assert_eq!(err.http_status(), Some(503));
		assert_eq!(transport.calls(Method::POST, "/token"), 4);
	}

	#[tokio::test]
	async fn bounded_mode_validates_before_any_call() {
		let transport = Arc::new(ScriptedTransport::new().token("78910"));
		let credential = Credential::new("", "456", "https://auth.test/token");
		let err = acquirer(&transport)
			.acquire(&credential, 3)
			.await
			.expect_err("Missing client id must fail.");

		assert!(matches!(
			err,
			Error::Validation(ValidationError::MissingField { field: "client_id" })
		));
		assert_eq!(transport.calls(Method::POST, "/token"), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn bounded_mode_treats_a_timeout_as_a_failed_attempt() {
		let transport = Arc::new(
			ScriptedTransport::new()
				.stall(Method::POST, "/token", Duration::from_secs(60))
				.token("78910"),
		);
		let settings =
			AcquireSettings { request_timeout: Some(Duration::from_secs(1)), ..Default::default() };
		let record = TokenAcquirer::new(transport.clone(), settings)
			.acquire(&test_credential(), 3)
			.await
			.expect("Second attempt should succeed.");

		assert_eq!(record.access_token.expose(), "78910");
		assert_eq!(transport.calls(Method::POST, "/token"), 2);
	}

	#[tokio::test]
	async fn oversized_token_ttl_is_a_config_error() {
		let transport = Arc::new(ScriptedTransport::new().token("78910"));
		let settings = AcquireSettings { token_ttl: Duration::MAX, ..Default::default() };
		let err = TokenAcquirer::new(transport, settings)
			.request_token(&test_credential())
			.await
			.expect_err("Unrepresentable expiry must be rejected.");

		assert!(matches!(err, Error::Config(ConfigError::TokenTtlOutOfRange { .. })));
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_mode_treats_a_timeout_as_a_failed_attempt() {
		let transport = Arc::new(
			ScriptedTransport::new()
				.stall(Method::POST, "/token", Duration::from_secs(60))
				.token("78910"),
		);
		let settings =
			AcquireSettings { request_timeout: Some(Duration::from_secs(1)), ..Default::default() };
		let latch = FatalLatch::new();
		let record = TokenAcquirer::new(transport.clone(), settings)
			.acquire_with_backoff(&test_credential(), &fast_backoff(5), &latch)
			.await
			.expect("Backoff mode should outlast the timeout.");

		assert_eq!(record.access_token.expose(), "78910");
		assert_eq!(transport.calls(Method::POST, "/token"), 2);
		assert!(!latch.is_triggered());
	}

	#[tokio::test]
	async fn backoff_mode_rejects_invalid_credentials_without_calls() {
		let transport = Arc::new(ScriptedTransport::new().token("78910"));
		let latch = FatalLatch::new();
		let credential = Credential::new("123", "456", "");
		let err = acquirer(&transport)
			.acquire_with_backoff(&credential, &fast_backoff(5), &latch)
			.await
			.expect_err("Invalid credential must be fatal.");

		match &err {
			Error::Unrecoverable { source } => assert!(matches!(
				source.as_ref(),
				Error::Validation(ValidationError::MissingField { field: "token_endpoint" })
			)),
			other => panic!("Unexpected error: {other:?}"),
		}

		assert_eq!(transport.calls(Method::POST, "/token"), 0);
		assert!(latch.is_triggered());
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_mode_retries_transient_failures() {
		let transport = Arc::new(
			ScriptedTransport::new()
				.respond(Method::POST, "/token", 503, r#"{"error":"temporarily_unavailable"}"#)
				.respond(Method::POST, "/token", 502, "")
				.token("78910"),
		);
		let latch = FatalLatch::new();
		let record = acquirer(&transport)
			.acquire_with_backoff(&test_credential(), &fast_backoff(5), &latch)
			.await
			.expect("Backoff mode should eventually succeed.");

		assert_eq!(record.access_token.expose(), "78910");
		assert_eq!(transport.calls(Method::POST, "/token"), 3);
		assert!(!latch.is_triggered());
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_mode_stops_on_unrecoverable_errors() {
		let transport = Arc::new(ScriptedTransport::new().respond(
			Method::POST,
			"/token",
			401,
			r#"{"error":"invalid_client"}"#,
		));
		let latch = FatalLatch::new();
		let err = acquirer(&transport)
			.acquire_with_backoff(&test_credential(), &fast_backoff(5), &latch)
			.await
			.expect_err("Invalid client must be fatal.");

		assert!(matches!(err, Error::Unrecoverable { .. }));
		assert_eq!(transport.calls(Method::POST, "/token"), 1);
		assert!(matches!(latch.take(), Some(Error::Unrecoverable { .. })));
	}

	#[tokio::test(start_paused = true)]
	async fn backoff_mode_exhaustion_is_fatal() {
		let transport = Arc::new(ScriptedTransport::new().fail(Method::POST, "/token"));
		let latch = FatalLatch::new();
		let err = acquirer(&transport)
			.acquire_with_backoff(&test_credential(), &fast_backoff(3), &latch)
			.await
			.expect_err("Network failures must exhaust the attempts.");

		assert!(matches!(err, Error::ServiceUnavailable { attempts: 3, .. }));
		assert_eq!(transport.calls(Method::POST, "/token"), 3);
		assert!(latch.is_triggered());
	}
}
