//! Thread-safe in-memory [`TokenStore`] implementation for single-process deployments and tests.

// self
use crate::{
	_prelude::*,
	auth::TokenRecord,
	store::{DEFAULT_TOKEN_TTL, RecordTable, StoreFuture, StoreKey, StoredRecord, TokenStore},
};

/// In-process token store enforcing the `(client_id, token_endpoint)` uniqueness constraint.
///
/// Expired records are invisible to [`TokenStore::get`] immediately; [`MemoryStore::sweep_expired`]
/// reclaims their memory.
#[derive(Clone, Debug)]
pub struct MemoryStore {
	table: Arc<RwLock<RecordTable>>,
	ttl: Duration,
}
impl MemoryStore {
	/// Creates an empty store stamping `ttl` onto inserted tokens.
	pub fn new(ttl: Duration) -> Self {
		Self { table: Default::default(), ttl }
	}

	/// Lifetime stamped onto inserted tokens.
	pub fn ttl(&self) -> Duration {
		self.ttl
	}

	/// Removes records that expired at `now`, returning how many were dropped.
	pub fn sweep_expired(&self, now: OffsetDateTime) -> usize {
		self.table.write().sweep(now)
	}

	/// Number of records currently held, including expired ones not yet swept.
	pub fn len(&self) -> usize {
		self.table.read().len()
	}

	/// Returns `true` when no record is held.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
impl Default for MemoryStore {
	fn default() -> Self {
		Self::new(DEFAULT_TOKEN_TTL)
	}
}
impl TokenStore for MemoryStore {
	fn get<'a>(
		&'a self,
		client_id: &'a str,
		token_endpoint: &'a str,
	) -> StoreFuture<'a, Option<TokenRecord>> {
		let key = StoreKey::new(client_id, token_endpoint);
		let found = self.table.read().get(&key, OffsetDateTime::now_utc());

		Box::pin(async move { Ok(found) })
	}

	fn insert(&self, token: TokenRecord) -> StoreFuture<'_, StoredRecord> {
		let outcome = self.table.write().insert(token, self.ttl, OffsetDateTime::now_utc());

		Box::pin(async move { outcome })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn token(access: &str) -> TokenRecord {
		TokenRecord::builder("123", "https://auth.test/token")
			.access_token(access)
			.expires_in(Duration::from_secs(1))
			.build()
			.expect("Token fixture should build.")
	}

	#[tokio::test]
	async fn get_returns_the_inserted_token_with_stamped_ttl() {
		let ttl = Duration::from_secs(3_600);
		let store = MemoryStore::new(ttl);
		let stored = store.insert(token("78910")).await.expect("Insert should succeed.");
		let fetched = store
			.get("123", "https://auth.test/token")
			.await
			.expect("Get should succeed.")
			.expect("Inserted token should be visible.");

		assert_eq!(fetched.access_token.expose(), "78910");
		assert_eq!(fetched.expires_at, stored.meta.created + ttl);
		assert!(store.get("123", "https://auth.test/other").await.expect("Get works.").is_none());
	}

	#[tokio::test]
	async fn duplicate_insert_keeps_the_first_record() {
		let store = MemoryStore::default();

		store.insert(token("first")).await.expect("First insert should succeed.");

		let err = store.insert(token("second")).await.expect_err("Second insert should clash.");

		assert!(err.is_duplicate());

		let fetched = store
			.get("123", "https://auth.test/token")
			.await
			.expect("Get should succeed.")
			.expect("Record should exist.");

		assert_eq!(fetched.access_token.expose(), "first");
		assert_eq!(store.len(), 1);
	}

	#[tokio::test]
	async fn zero_ttl_records_are_swept() {
		let store = MemoryStore::new(Duration::ZERO);

		store.insert(token("a")).await.expect("Insert should succeed.");

		assert!(store.get("123", "https://auth.test/token").await.expect("Get works.").is_none());
		assert_eq!(store.sweep_expired(OffsetDateTime::now_utc()), 1);
		assert!(store.is_empty());
	}
}
