//! Storage contracts and built-in store implementations for issued access tokens.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, auth::TokenRecord, error::ConfigError};

/// Lifetime stamped on persisted tokens unless a store is given another one (two weeks).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Instant `ttl` after `now`, rejecting lifetimes the calendar cannot represent.
pub fn expiry_after(now: OffsetDateTime, ttl: Duration) -> Result<OffsetDateTime, ConfigError> {
	time::Duration::try_from(ttl)
		.ok()
		.and_then(|ttl| now.checked_add(ttl))
		.ok_or(ConfigError::TokenTtlOutOfRange { ttl_ms: saturating_millis(ttl) })
}

fn saturating_millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Boxed future returned by [`TokenStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Durable token store keyed by `(client_id, token_endpoint)`.
///
/// Writes are insert-only. A second insert for a key that still holds an unexpired record
/// fails with [`StoreError::Duplicate`], which callers treat as "someone else won the race".
pub trait TokenStore
where
	Self: Send + Sync,
{
	/// Fetches the unexpired token issued to `client_id` by `token_endpoint`, if any.
	fn get<'a>(
		&'a self,
		client_id: &'a str,
		token_endpoint: &'a str,
	) -> StoreFuture<'a, Option<TokenRecord>>;

	/// Inserts a token, stamping its expiry as insertion time plus the store TTL.
	fn insert(&self, token: TokenRecord) -> StoreFuture<'_, StoredRecord>;
}

/// Error type produced by [`TokenStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
	/// Store TTL cannot be added to the insertion instant.
	#[error("Store TTL of {ttl_ms} ms is out of range.")]
	TtlOutOfRange {
		/// Configured lifetime in milliseconds (saturated).
		ttl_ms: u64,
	},
	/// An unexpired record already exists for the key.
	#[error("A token for {client_id} at {token_endpoint} is already stored.")]
	Duplicate {
		/// Client identifier of the rejected record.
		client_id: String,
		/// Token endpoint of the rejected record.
		token_endpoint: String,
	},
}
impl StoreError {
	/// Returns `true` for the uniqueness-constraint violation.
	pub fn is_duplicate(&self) -> bool {
		matches!(self, Self::Duplicate { .. })
	}
}

/// Unique key identifying a stored token record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
	/// Client identifier component.
	pub client_id: String,
	/// Token endpoint component.
	pub token_endpoint: String,
}
impl StoreKey {
	/// Builds a key from its components.
	pub fn new(client_id: impl Into<String>, token_endpoint: impl Into<String>) -> Self {
		Self { client_id: client_id.into(), token_endpoint: token_endpoint.into() }
	}

	/// Key under which `token` is stored.
	pub fn of(token: &TokenRecord) -> Self {
		Self::new(token.client_id.as_str(), token.token_endpoint.as_str())
	}
}

/// Bookkeeping timestamps attached to every stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
	/// Insertion instant.
	pub created: OffsetDateTime,
	/// Last write instant.
	pub updated: OffsetDateTime,
}

/// Record as persisted by a [`TokenStore`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRecord {
	/// Write timestamps.
	pub meta: RecordMeta,
	/// Stored token with its stamped expiry.
	pub token: TokenRecord,
}

/// Key/record table shared by the built-in stores.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordTable(HashMap<StoreKey, StoredRecord>);
impl RecordTable {
	pub(crate) fn from_entries(entries: Vec<(StoreKey, StoredRecord)>) -> Self {
		Self(entries.into_iter().collect())
	}

	pub(crate) fn entries(&self) -> Vec<(&StoreKey, &StoredRecord)> {
		self.0.iter().collect()
	}

	pub(crate) fn get(&self, key: &StoreKey, now: OffsetDateTime) -> Option<TokenRecord> {
		self.0.get(key).filter(|stored| !stored.token.is_expired_at(now)).map(|s| s.token.clone())
	}

	pub(crate) fn insert(
		&mut self,
		mut token: TokenRecord,
		ttl: Duration,
		now: OffsetDateTime,
	) -> Result<StoredRecord, StoreError> {
		let key = StoreKey::of(&token);

		if self.0.get(&key).is_some_and(|stored| !stored.token.is_expired_at(now)) {
			return Err(StoreError::Duplicate {
				client_id: key.client_id,
				token_endpoint: key.token_endpoint,
			});
		}

		token.expires_at = expiry_after(now, ttl)
			.map_err(|_| StoreError::TtlOutOfRange { ttl_ms: saturating_millis(ttl) })?;

		let stored = StoredRecord { meta: RecordMeta { created: now, updated: now }, token };

		self.0.insert(key, stored.clone());

		Ok(stored)
	}

	/// Puts back the row `key` held before a write that could not be made durable.
	pub(crate) fn restore(&mut self, key: StoreKey, previous: Option<StoredRecord>) {
		match previous {
			Some(stored) => self.0.insert(key, stored),
			None => self.0.remove(&key),
		};
	}

	pub(crate) fn raw(&self, key: &StoreKey) -> Option<&StoredRecord> {
		self.0.get(key)
	}

	pub(crate) fn sweep(&mut self, now: OffsetDateTime) -> usize {
		let before = self.0.len();

		self.0.retain(|_, stored| !stored.token.is_expired_at(now));

		before - self.0.len()
	}

	pub(crate) fn len(&self) -> usize {
		self.0.len()
	}
}
