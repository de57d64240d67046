//! OAuth 2.0 client-credentials token broker: deduplicated token acquisition, persistent token
//! stores, and bearer-injecting HTTP clients that refresh once when a token is rejected.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod acquire;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod obs;
pub mod store;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and helpers for tests; enabled via `cfg(test)` or the `test`
	//! crate feature.

	pub use crate::_prelude::*;

	// std
	use std::collections::VecDeque;
	// crates.io
	use oauth2::{
		HttpRequest, HttpResponse,
		http::{HeaderMap, Method, StatusCode},
	};
	// self
	use crate::{
		auth::{Credential, TokenRecord},
		config::BrokerConfig,
		error::TransportError,
		http::{HttpTransport, TransportFuture},
		store::{RecordMeta, StoreFuture, StoredRecord, TokenStore},
	};

	/// Base URL used by fixtures; never resolved because [`ScriptedTransport`] answers locally.
	pub const TEST_BASE: &str = "https://auth.test";

	/// Scripted answer replayed by [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub enum Scripted {
		/// Respond with the given status and body.
		Respond {
			/// HTTP status code.
			status: u16,
			/// Raw body.
			body: String,
		},
		/// Fail at the network layer.
		Fail,
		/// Hang for the given time, then answer 504.
		Stall(Duration),
	}

	/// Request captured by [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub struct RecordedRequest {
		/// HTTP method.
		pub method: Method,
		/// Request path.
		pub path: String,
		/// Request headers.
		pub headers: HeaderMap,
		/// Request body.
		pub body: Vec<u8>,
	}
	impl RecordedRequest {
		/// Body decoded as UTF-8 (lossy).
		pub fn body_text(&self) -> String {
			String::from_utf8_lossy(&self.body).into_owned()
		}

		/// All `Authorization` header values in send order.
		pub fn authorization(&self) -> Vec<String> {
			self.headers
				.get_all(oauth2::http::header::AUTHORIZATION)
				.iter()
				.filter_map(|value| value.to_str().ok())
				.map(str::to_owned)
				.collect()
		}
	}

	/// Deterministic [`HttpTransport`] that replays queued answers per method + path.
	///
	/// The final queued answer of a route repeats forever; unknown routes answer 404.
	#[derive(Debug, Default)]
	pub struct ScriptedTransport {
		routes: Mutex<HashMap<(Method, String), VecDeque<Scripted>>>,
		requests: Mutex<Vec<RecordedRequest>>,
		latency: Option<Duration>,
	}
	impl ScriptedTransport {
		/// Creates an empty transport.
		pub fn new() -> Self {
			Self::default()
		}

		/// Delays every answer by `latency` (uses the tokio clock).
		pub fn with_latency(mut self, latency: Duration) -> Self {
			self.latency = Some(latency);

			self
		}

		/// Queues a response for `method` + `path`.
		pub fn respond(self, method: Method, path: &str, status: u16, body: &str) -> Self {
			self.push(method, path, Scripted::Respond { status, body: body.into() })
		}

		/// Queues a network failure for `method` + `path`.
		pub fn fail(self, method: Method, path: &str) -> Self {
			self.push(method, path, Scripted::Fail)
		}

		/// Queues an answer that hangs for `delay` before returning 504.
		pub fn stall(self, method: Method, path: &str, delay: Duration) -> Self {
			self.push(method, path, Scripted::Stall(delay))
		}

		/// Queues a successful token endpoint answer on `POST /token`.
		pub fn token(self, access_token: &str) -> Self {
			let body = format!("{{\"access_token\":\"{access_token}\",\"token_type\":\"bearer\"}}");

			self.respond(Method::POST, "/token", 200, &body)
		}

		/// Number of requests observed for `method` + `path`.
		pub fn calls(&self, method: Method, path: &str) -> usize {
			self.requests.lock().iter().filter(|req| req.method == method && req.path == path).count()
		}

		/// Requests observed for `method` + `path`, oldest first.
		pub fn requests_to(&self, method: Method, path: &str) -> Vec<RecordedRequest> {
			self.requests
				.lock()
				.iter()
				.filter(|req| req.method == method && req.path == path)
				.cloned()
				.collect()
		}

		fn push(self, method: Method, path: &str, answer: Scripted) -> Self {
			self.routes.lock().entry((method, path.to_owned())).or_default().push_back(answer);

			self
		}

		fn next_answer(&self, method: &Method, path: &str) -> Option<Scripted> {
			let mut routes = self.routes.lock();
			let queue = routes.get_mut(&(method.clone(), path.to_owned()))?;

			if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
		}
	}
	impl HttpTransport for ScriptedTransport {
		fn execute(&self, request: HttpRequest) -> TransportFuture<'_> {
			Box::pin(async move {
				let (parts, body) = request.into_parts();
				let path = parts.uri.path().to_owned();
				let answer = self.next_answer(&parts.method, &path);

				self.requests.lock().push(RecordedRequest {
					method: parts.method,
					path,
					headers: parts.headers,
					body,
				});

				if let Some(latency) = self.latency {
					tokio::time::sleep(latency).await;
				}

				match answer {
					Some(Scripted::Respond { status, body }) => {
						let mut response = HttpResponse::new(body.into_bytes());

						*response.status_mut() =
							StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

						Ok(response)
					},
					Some(Scripted::Stall(delay)) => {
						tokio::time::sleep(delay).await;

						let mut response = HttpResponse::new(Vec::new());

						*response.status_mut() = StatusCode::GATEWAY_TIMEOUT;

						Ok(response)
					},
					Some(Scripted::Fail) => Err(TransportError::from(std::io::Error::new(
						std::io::ErrorKind::ConnectionRefused,
						"scripted network failure",
					))),
					None => {
						let mut response = HttpResponse::new(Vec::new());

						*response.status_mut() = StatusCode::NOT_FOUND;

						Ok(response)
					},
				}
			})
		}
	}

	/// [`TokenStore`] double that accepts every insert unchanged and never returns a record.
	#[derive(Debug, Default)]
	pub struct ForgetfulStore;
	impl TokenStore for ForgetfulStore {
		fn get<'a>(&'a self, _: &'a str, _: &'a str) -> StoreFuture<'a, Option<TokenRecord>> {
			Box::pin(async { Ok(None) })
		}

		fn insert(&self, token: TokenRecord) -> StoreFuture<'_, StoredRecord> {
			Box::pin(async move {
				let now = OffsetDateTime::now_utc();

				Ok(StoredRecord { meta: RecordMeta { created: now, updated: now }, token })
			})
		}
	}

	/// Credential fixture pointing at [`TEST_BASE`]`/token`.
	pub fn test_credential() -> Credential {
		Credential::new("123", "456", format!("{TEST_BASE}/token"))
			.with_scope(["meter"])
			.expect("Fixture scope should be valid.")
	}

	/// Configuration fixture with jitter disabled and short delays.
	pub fn test_config() -> BrokerConfig {
		let mut config = BrokerConfig::default();

		config.retry_min_timeout = Duration::from_millis(10);
		config.retry_max_timeout = Duration::from_millis(80);
		config.retry_max_attempts = 5;
		config.retry_jitter = false;
		config.request_timeout = Duration::from_secs(5);
		config.credentials.insert("meter".into(), test_credential());

		config
	}

	/// Parses a URL fixture.
	pub fn test_url(path: &str) -> Url {
		Url::parse(&format!("{TEST_BASE}{path}")).expect("Fixture URL should parse.")
	}
}

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::Arc,
		time::Duration,
	};

	pub use async_lock::OnceCell as AsyncOnceCell;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _};
