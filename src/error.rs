//! Broker-level error types shared across acquisition, caching, stores, and clients.
//!
//! Every variant is cheap to clone so a single in-flight token acquisition can hand the
//! very same outcome to all of its waiters.

// crates.io
use serde_json::Value;
// self
use crate::_prelude::*;

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type SharedError = Arc<dyn StdError + Send + Sync>;
type JsonPathError = serde_path_to_error::Error<serde_json::Error>;

/// Canonical broker error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Credential is missing a required field or carries an invalid one.
	#[error(transparent)]
	Validation(#[from] ValidationError),
	/// Temporary upstream failure; retry later.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS, timeout).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Upstream answered with a non-success HTTP status.
	#[error(transparent)]
	Upstream(#[from] UpstreamError),

	/// Bounded acquisition exhausted every attempt without obtaining a token.
	#[error("Service unavailable: no access token was obtained after {attempts} attempts.")]
	ServiceUnavailable {
		/// Number of token endpoint calls performed.
		attempts: u32,
		/// Failure observed on the final attempt, if any.
		#[source]
		last_error: Option<Box<Error>>,
	},
	/// Authorization server rejected the credential in a way retries cannot fix.
	#[error("Unrecoverable authorization failure.")]
	Unrecoverable {
		/// Classified upstream failure.
		#[source]
		source: Box<Error>,
	},
	/// Invalid-token failure could not be healed because the refresh step obtained no token.
	#[error("Could not refresh the access token after {attempts} attempts.")]
	RefreshExhausted {
		/// Attempts granted to the refresh step.
		attempts: u32,
		/// Original invalid-token failure returned by the wrapped call.
		#[source]
		source: Box<Error>,
	},
}
impl Error {
	/// HTTP status that best describes the failure when surfaced to a public caller.
	pub fn http_status(&self) -> Option<u16> {
		match self {
			Self::ServiceUnavailable { .. } => Some(503),
			Self::Upstream(upstream) => Some(upstream.status),
			Self::Unrecoverable { source } => source.http_status(),
			Self::RefreshExhausted { source, .. } => source.http_status(),
			_ => None,
		}
	}

	/// Returns `true` when the error may be shown to remote callers verbatim.
	pub fn is_public(&self) -> bool {
		matches!(self, Self::ServiceUnavailable { .. })
	}

	/// Returns the upstream HTTP failure carried by this error, if any.
	pub fn upstream(&self) -> Option<&UpstreamError> {
		match self {
			Self::Upstream(upstream) => Some(upstream),
			_ => None,
		}
	}
}

/// Configuration and request construction failures raised by the broker.
#[derive(Clone, Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: SharedError,
	},
	/// HTTP request construction failed.
	#[error("HTTP request could not be constructed.")]
	HttpRequest {
		/// Underlying `http` crate failure.
		#[source]
		source: Arc<oauth2::http::Error>,
	},
	/// A header value contains bytes that cannot be sent.
	#[error("Header `{name}` has an invalid value.")]
	InvalidHeaderValue {
		/// Header name.
		name: &'static str,
	},
	/// Configuration document could not be parsed.
	#[error("Configuration is invalid at `{path}`.")]
	Parse {
		/// JSON path of the offending field.
		path: String,
		/// Structured parsing failure.
		#[source]
		source: Arc<JsonPathError>,
	},
	/// Configuration file could not be read.
	#[error("Configuration file {path} could not be read.")]
	Read {
		/// File that failed to load.
		path: String,
		/// Underlying IO failure.
		#[source]
		source: Arc<std::io::Error>,
	},
	/// Token lifetime is too large to stamp an expiry instant with.
	#[error("Token TTL of {ttl_ms} ms is out of range.")]
	TokenTtlOutOfRange {
		/// Configured lifetime in milliseconds (saturated).
		ttl_ms: u64,
	},
	/// No credential bundle is configured under the requested name.
	#[error("No credential named `{name}` is configured.")]
	UnknownCredential {
		/// Requested bundle name.
		name: String,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::HttpClientBuild { source: Arc::new(src) }
	}

	pub(crate) fn parse(e: JsonPathError) -> Self {
		Self::Parse { path: e.path().to_string(), source: Arc::new(e) }
	}
}
impl From<oauth2::http::Error> for ConfigError {
	fn from(e: oauth2::http::Error) -> Self {
		Self::HttpRequest { source: Arc::new(e) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Credential validation failures; raised before any cache or network access.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum ValidationError {
	/// A required credential field is empty.
	#[error("\"{field}\" is required.")]
	MissingField {
		/// Name of the missing field.
		field: &'static str,
	},
	/// Token endpoint is not an absolute URL.
	#[error("\"token_endpoint\" is not a valid URL: {value}.")]
	InvalidTokenEndpoint {
		/// Raw configured value.
		value: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Scope list contains an invalid entry.
	#[error(transparent)]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
}

/// Temporary failure variants (safe to retry).
#[derive(Clone, Debug, ThisError)]
pub enum TransientError {
	/// Token endpoint answered successfully but without a usable token.
	#[error("Token endpoint returned an unexpected response: {message}.")]
	TokenEndpoint {
		/// Broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Token endpoint responded with malformed JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	TokenResponseParse {
		/// Structured parsing failure.
		#[source]
		source: Arc<JsonPathError>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
}

/// Transport-level failures (network, IO, timeout).
#[derive(Clone, Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling {target}.")]
	Network {
		/// Short description of the remote that failed.
		target: &'static str,
		/// Transport-specific network error.
		#[source]
		source: SharedError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred during transport.")]
	Io(#[source] Arc<std::io::Error>),
	/// The call did not complete within its time budget.
	#[error("Request timed out after {after:?}.")]
	Timeout {
		/// Budget that elapsed.
		after: Duration,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::Network { target: "the remote server", source: Arc::new(src) }
	}
}
impl From<std::io::Error> for TransportError {
	fn from(e: std::io::Error) -> Self {
		Self::Io(Arc::new(e))
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		Self::network(e)
	}
}

/// Non-success HTTP answer from a token endpoint or a protected resource.
///
/// `data` holds the response body when it parses as JSON; any other body is dropped so
/// classification never has to deal with partial payloads.
#[derive(Clone, Debug, PartialEq, ThisError)]
#[error("Upstream responded with HTTP {status}.")]
pub struct UpstreamError {
	/// HTTP status code.
	pub status: u16,
	/// JSON body, when present and well formed.
	pub data: Option<Value>,
}
impl UpstreamError {
	/// Creates an error from a status code and optional JSON body.
	pub fn new(status: u16, data: Option<Value>) -> Self {
		Self { status, data }
	}

	/// Builds the error from a raw response body, keeping it only when it is valid JSON.
	pub fn from_body(status: u16, body: &[u8]) -> Self {
		Self { status, data: serde_json::from_slice(body).ok() }
	}

	/// OAuth `error` code carried by the body.
	pub fn error_code(&self) -> Option<&str> {
		self.data.as_ref()?.get("error")?.as_str()
	}

	/// Top-level error `name` carried by the body.
	pub fn error_name(&self) -> Option<&str> {
		self.data.as_ref()?.get("name")?.as_str()
	}

	/// Names listed in the body's `errors` array, skipping malformed entries.
	pub fn listed_error_names(&self) -> impl Iterator<Item = &str> {
		self.data
			.as_ref()
			.and_then(|data| data.get("errors"))
			.and_then(Value::as_array)
			.into_iter()
			.flatten()
			.filter_map(|entry| entry.get("name").and_then(Value::as_str))
	}
}
