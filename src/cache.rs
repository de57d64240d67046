//! In-process access token cache with per-credential in-flight deduplication.
//!
//! Every credential maps to at most one cache entry. A miss installs a pending entry holding
//! a shared once-cell; every caller that arrives while it is pending awaits that same cell, so
//! exactly one store lookup and at most one acquisition run per key at a time. The first waiter
//! to observe the outcome settles the entry: successes become ready tokens, failures are
//! dropped so the next call starts over.

// crates.io
use tokio::time::Instant;
// self
use crate::{
	_prelude::*,
	acquire::TokenAcquirer,
	auth::{CacheKey, Credential, TokenRecord, TokenSecret},
	config::CacheSettings,
	http::HttpTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::TokenStore,
};

type SharedOutcome = Arc<AsyncOnceCell<Result<TokenRecord>>>;

#[derive(Clone)]
enum Slot {
	Pending(SharedOutcome),
	Ready(TokenRecord),
}

#[derive(Clone)]
struct CacheEntry {
	slot: Slot,
	inserted_at: Instant,
	seq: u64,
}

#[derive(Default)]
struct CacheState {
	entries: HashMap<CacheKey, CacheEntry>,
	refreshing: HashMap<CacheKey, SharedOutcome>,
	next_seq: u64,
}
impl CacheState {
	fn sweep(&mut self, now: Instant, wall: OffsetDateTime, max_age: Duration) {
		self.entries.retain(|_, entry| match &entry.slot {
			Slot::Pending(_) => true,
			Slot::Ready(record) =>
				now.saturating_duration_since(entry.inserted_at) < max_age
					&& !record.is_expired_at(wall),
		});
	}

	fn ready(&self, key: &CacheKey) -> Option<&TokenRecord> {
		match self.entries.get(key).map(|entry| &entry.slot) {
			Some(Slot::Ready(record)) => Some(record),
			_ => None,
		}
	}

	// Pending entries are never evicted, so the map may briefly exceed `max_size` while only
	// in-flight lookups remain.
	fn put(&mut self, key: CacheKey, slot: Slot, now: Instant, max_size: usize) {
		if !self.entries.contains_key(&key) {
			while self.entries.len() >= max_size.max(1) {
				let Some(oldest) = self
					.entries
					.iter()
					.filter(|(_, entry)| matches!(entry.slot, Slot::Ready(_)))
					.min_by_key(|(_, entry)| entry.seq)
					.map(|(k, _)| k.clone())
				else {
					break;
				};

				self.entries.remove(&oldest);
			}
		}

		let seq = self.next_seq;

		self.next_seq += 1;
		self.entries.insert(key, CacheEntry { slot, inserted_at: now, seq });
	}

	fn is_pending(&self, key: &CacheKey, cell: &SharedOutcome) -> bool {
		self.entries
			.get(key)
			.is_some_and(|entry| matches!(&entry.slot, Slot::Pending(c) if Arc::ptr_eq(c, cell)))
	}
}

/// Memoizing token cache shared by every authorized client of a broker.
pub struct AccessTokenCache<T = dyn HttpTransport>
where
	T: ?Sized,
{
	acquirer: TokenAcquirer<T>,
	store: Arc<dyn TokenStore>,
	settings: CacheSettings,
	state: Mutex<CacheState>,
}
impl<T> AccessTokenCache<T>
where
	T: ?Sized + HttpTransport,
{
	/// Creates an empty cache.
	pub fn new(
		acquirer: TokenAcquirer<T>,
		store: Arc<dyn TokenStore>,
		settings: CacheSettings,
	) -> Self {
		Self { acquirer, store, settings, state: Default::default() }
	}

	/// Acquirer used on misses and refreshes.
	pub fn acquirer(&self) -> &TokenAcquirer<T> {
		&self.acquirer
	}

	/// Backing token store.
	pub fn store(&self) -> &Arc<dyn TokenStore> {
		&self.store
	}

	/// Cache bounds.
	pub fn settings(&self) -> &CacheSettings {
		&self.settings
	}

	/// Returns an access token for `credential`.
	///
	/// Fresh cached tokens are returned without I/O. Otherwise the store is consulted, then the
	/// acquirer in bounded mode; the acquired token is persisted before it is cached. Concurrent
	/// callers for one credential share a single lookup and its outcome.
	pub async fn get_access_token(&self, credential: &Credential) -> Result<TokenSecret> {
		credential.validate()?;

		let key = credential.cache_key();
		let cell = {
			let mut state = self.state.lock();
			let now = Instant::now();

			state.sweep(now, OffsetDateTime::now_utc(), self.settings.max_age);

			match state.entries.get(&key).map(|entry| entry.slot.clone()) {
				Some(Slot::Ready(record)) => return Ok(record.access_token),
				Some(Slot::Pending(cell)) => cell,
				None => {
					let cell = Arc::new(AsyncOnceCell::new());

					state.put(key.clone(), Slot::Pending(cell.clone()), now, self.settings.max_size);

					cell
				},
			}
		};
		let outcome = cell.get_or_init(|| self.load(credential)).await.clone();

		self.settle(&key, &cell, &outcome);

		outcome.map(|record| record.access_token)
	}

	/// Replaces `rejected` with a newly acquired token, persists it, and caches it.
	///
	/// Used when a resource rejects the current token, so the fresh-hit path is skipped for that
	/// token. Concurrent refreshes of one credential share a single bounded acquisition; a caller
	/// arriving after it finished receives the cached replacement as long as it differs from the
	/// token that caller saw rejected.
	pub async fn refresh_access_token(
		&self,
		credential: &Credential,
		rejected: &TokenSecret,
		max_retries: u32,
	) -> Result<TokenSecret> {
		let key = credential.cache_key();
		let cell = {
			let mut state = self.state.lock();

			state.sweep(Instant::now(), OffsetDateTime::now_utc(), self.settings.max_age);

			match state.refreshing.get(&key) {
				Some(cell) => cell.clone(),
				None => {
					if let Some(record) = state.ready(&key).filter(|r| &r.access_token != rejected) {
						return Ok(record.access_token.clone());
					}

					let cell: SharedOutcome = Arc::new(AsyncOnceCell::new());

					state.refreshing.insert(key.clone(), cell.clone());

					cell
				},
			}
		};
		let outcome = cell.get_or_init(|| self.reacquire(credential, max_retries)).await.clone();

		self.settle_refresh(&key, &cell, &outcome);

		outcome.map(|record| record.access_token)
	}

	/// Installs `record` as the fresh token for `credential`.
	pub fn prime(&self, credential: &Credential, record: TokenRecord) {
		let mut state = self.state.lock();

		state.put(
			credential.cache_key(),
			Slot::Ready(record),
			Instant::now(),
			self.settings.max_size,
		);
	}

	/// Drops the entry for `credential`, returning whether one existed.
	///
	/// Callers already awaiting an in-flight acquisition still receive its outcome.
	pub fn invalidate(&self, credential: &Credential) -> bool {
		self.state.lock().entries.remove(&credential.cache_key()).is_some()
	}

	/// Number of entries, pending ones included.
	pub fn len(&self) -> usize {
		self.state.lock().entries.len()
	}

	/// Returns `true` when nothing is cached or in flight.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	async fn reacquire(&self, credential: &Credential, max_retries: u32) -> Result<TokenRecord> {
		let span = FlowSpan::new(FlowKind::Refresh, "refresh_access_token");

		span.instrument(async move {
			obs::record_flow_outcome(FlowKind::Refresh, FlowOutcome::Attempt);

			let refreshed = match self.acquirer.acquire(credential, max_retries).await {
				Ok(record) => self.persist(record).await,
				Err(e) => Err(e),
			};

			obs::record_result(FlowKind::Refresh, refreshed)
		})
		.await
	}

	async fn load(&self, credential: &Credential) -> Result<TokenRecord> {
		if let Some(record) =
			self.store.get(&credential.client_id, &credential.token_endpoint).await?
		{
			return Ok(record);
		}

		let record = self.acquirer.acquire_default(credential).await?;

		self.persist(record).await
	}

	// A duplicate means a concurrent writer won; its token and ours are equally valid.
	pub(crate) async fn persist(&self, record: TokenRecord) -> Result<TokenRecord> {
		match self.store.insert(record.clone()).await {
			Ok(stored) => Ok(stored.token),
			Err(e) if e.is_duplicate() => Ok(record),
			Err(e) => Err(e.into()),
		}
	}

	fn settle(&self, key: &CacheKey, cell: &SharedOutcome, outcome: &Result<TokenRecord>) {
		let mut state = self.state.lock();

		if !state.is_pending(key, cell) {
			return;
		}

		match outcome {
			Ok(record) => {
				state.entries.remove(key);
				state.put(
					key.clone(),
					Slot::Ready(record.clone()),
					Instant::now(),
					self.settings.max_size,
				);
			},
			Err(_) => {
				state.entries.remove(key);
			},
		}
	}

	fn settle_refresh(&self, key: &CacheKey, cell: &SharedOutcome, outcome: &Result<TokenRecord>) {
		let mut state = self.state.lock();

		if !state.refreshing.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
			return;
		}

		state.refreshing.remove(key);

		if let Ok(record) = outcome {
			state.entries.remove(key);
			state.put(
				key.clone(),
				Slot::Ready(record.clone()),
				Instant::now(),
				self.settings.max_size,
			);
		}
	}
}
impl<T> Debug for AccessTokenCache<T>
where
	T: ?Sized,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessTokenCache")
			.field("settings", &self.settings)
			.field("entries", &self.state.lock().entries.len())
			.finish_non_exhaustive()
	}
}
