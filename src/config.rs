//! Broker configuration document and the policy objects derived from it.
//!
//! Keys are camelCase and every duration is expressed in milliseconds:
//!
//! ```json
//! {
//!   "accessTokenCache": { "maxSize": 100, "maxAge": 300000 },
//!   "tokenTtl": 1209600000,
//!   "maxRetries": 3,
//!   "retryMaxTimeout": 30000,
//!   "credentials": {
//!     "meter": {
//!       "client_id": "123",
//!       "client_secret": "456",
//!       "token_endpoint": "https://auth.example.com/token",
//!       "scope": ["meter"]
//!     }
//!   }
//! }
//! ```

// std
use std::{fs, path::Path};
// self
use crate::{
	_prelude::*,
	acquire::{AcquireSettings, BackoffPolicy},
	auth::Credential,
	error::ConfigError,
	store::{self, DEFAULT_TOKEN_TTL},
};

/// Bounds of the in-process access token cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
	/// Maximum number of cached credentials; the oldest entry is evicted on overflow.
	pub max_size: usize,
	/// Freshness window of a cached token.
	#[serde(with = "duration_ms", alias = "ttl")]
	pub max_age: Duration,
}
impl Default for CacheSettings {
	fn default() -> Self {
		Self { max_size: 100, max_age: Duration::from_secs(5 * 60) }
	}
}

/// Top-level broker configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
	/// In-process cache bounds.
	pub access_token_cache: CacheSettings,
	/// Lifetime stamped onto persisted tokens.
	#[serde(with = "duration_ms")]
	pub token_ttl: Duration,
	/// Retries granted to bounded acquisition (total attempts are `max_retries + 1`).
	pub max_retries: u32,
	/// First backoff delay of warm-up acquisition.
	#[serde(with = "duration_ms")]
	pub retry_min_timeout: Duration,
	/// Backoff delay cap of warm-up acquisition.
	#[serde(with = "duration_ms")]
	pub retry_max_timeout: Duration,
	/// Total attempts of warm-up acquisition.
	pub retry_max_attempts: u32,
	/// Randomizes backoff delays.
	pub retry_jitter: bool,
	/// Timeout applied to every token endpoint and wrapped call.
	#[serde(with = "duration_ms")]
	pub request_timeout: Duration,
	/// Named credential bundles.
	pub credentials: BTreeMap<String, Credential>,
}
impl BrokerConfig {
	/// Parses a JSON document, reporting the path of the first invalid field.
	///
	/// A `tokenTtl` too large to stamp an expiry with is rejected here rather than at the
	/// first acquisition.
	pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
		let de = &mut serde_json::Deserializer::from_str(json);
		let config: Self = serde_path_to_error::deserialize(de).map_err(ConfigError::parse)?;

		store::expiry_after(OffsetDateTime::now_utc(), config.token_ttl)?;

		Ok(config)
	}

	/// Reads and parses a JSON configuration file.
	pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read {
			path: path.display().to_string(),
			source: Arc::new(e),
		})?;

		Self::from_json_str(&raw)
	}

	/// Looks up a named credential.
	pub fn credential(&self, name: &str) -> Result<&Credential, ConfigError> {
		self.credentials.get(name).ok_or_else(|| ConfigError::UnknownCredential { name: name.into() })
	}

	/// Cache bounds.
	pub fn cache_settings(&self) -> CacheSettings {
		self.access_token_cache.clone()
	}

	/// Bounded acquisition settings.
	pub fn acquire_settings(&self) -> AcquireSettings {
		AcquireSettings {
			max_retries: self.max_retries,
			request_timeout: Some(self.request_timeout),
			token_ttl: self.token_ttl,
		}
	}

	/// Warm-up backoff schedule.
	pub fn backoff_policy(&self) -> BackoffPolicy {
		BackoffPolicy {
			max_attempts: self.retry_max_attempts,
			min_delay: self.retry_min_timeout,
			max_delay: self.retry_max_timeout,
			jitter: self.retry_jitter,
			..Default::default()
		}
	}
}
impl Default for BrokerConfig {
	fn default() -> Self {
		let backoff = BackoffPolicy::default();

		Self {
			access_token_cache: CacheSettings::default(),
			token_ttl: DEFAULT_TOKEN_TTL,
			max_retries: 3,
			retry_min_timeout: backoff.min_delay,
			retry_max_timeout: backoff.max_delay,
			retry_max_attempts: backoff.max_attempts,
			retry_jitter: backoff.jitter,
			request_timeout: Duration::from_secs(30),
			credentials: BTreeMap::new(),
		}
	}
}

mod duration_ms {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
