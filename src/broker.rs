//! Explicitly initialised broker that owns the shared token cache.

// crates.io
use tokio::task::JoinSet;
// self
use crate::{
	_prelude::*,
	acquire::{BackoffPolicy, TokenAcquirer},
	auth::Credential,
	cache::AccessTokenCache,
	client::AuthorizedClient,
	config::BrokerConfig,
	error::ConfigError,
	http::{HttpClient, HttpTransport, TransportClient},
	lifecycle::FatalSignal,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	store::TokenStore,
};
#[cfg(feature = "reqwest")] use crate::{http::ReqwestHttpClient, lifecycle::ProcessExit, store::MemoryStore};

/// Process-wide token broker.
///
/// Construct one during startup and hand it (or the clients it creates) to the components that
/// call protected resources. Every client shares the broker's [`AccessTokenCache`].
pub struct TokenBroker<T = dyn HttpTransport>
where
	T: ?Sized,
{
	config: BrokerConfig,
	transport: Arc<T>,
	cache: Arc<AccessTokenCache<T>>,
	fatal: Arc<dyn FatalSignal>,
}
impl<T> TokenBroker<T>
where
	T: ?Sized + HttpTransport,
{
	/// Wires the cache, acquirer, and fatal hook from `config`.
	pub fn new(
		config: BrokerConfig,
		store: Arc<dyn TokenStore>,
		transport: Arc<T>,
		fatal: Arc<dyn FatalSignal>,
	) -> Self {
		let acquirer = TokenAcquirer::new(transport.clone(), config.acquire_settings());
		let cache = Arc::new(AccessTokenCache::new(acquirer, store, config.cache_settings()));

		Self { config, transport, cache, fatal }
	}

	/// Active configuration.
	pub fn config(&self) -> &BrokerConfig {
		&self.config
	}

	/// Shared token cache.
	pub fn cache(&self) -> &Arc<AccessTokenCache<T>> {
		&self.cache
	}

	/// Transport used for token calls.
	pub fn transport(&self) -> &Arc<T> {
		&self.transport
	}

	/// Looks up a named credential.
	pub fn credential(&self, name: &str) -> Result<&Credential, ConfigError> {
		self.config.credential(name)
	}

	/// Decorates `inner` with tokens for the credential configured under `name`.
	pub fn authorized_client<C>(&self, name: &str, inner: Arc<C>) -> Result<AuthorizedClient<C, T>>
	where
		C: ?Sized + HttpClient,
	{
		let credential = self.credential(name)?.clone();

		Ok(AuthorizedClient::new(inner, self.cache.clone(), credential)
			.with_refresh_retries(self.config.max_retries))
	}

	/// Acquires tokens for every configured credential concurrently.
	///
	/// Each credential is served from the store when possible, otherwise through the backoff
	/// mode, which fires the fatal signal on its own for broken credentials. All tasks run to
	/// completion; the first failure, if any, is returned afterwards.
	pub async fn warm_up(&self) -> Result<()> {
		let span = FlowSpan::new(FlowKind::WarmUp, "warm_up");

		span.instrument(async {
			let policy = self.config.backoff_policy();
			let mut tasks = JoinSet::new();

			for credential in self.config.credentials.values() {
				tasks.spawn(warm_one(
					self.cache.clone(),
					credential.clone(),
					policy.clone(),
					self.fatal.clone(),
				));
			}

			let mut first_error = None;

			while let Some(joined) = tasks.join_next().await {
				match joined {
					Ok(Ok(())) => {},
					Ok(Err(e)) => {
						first_error.get_or_insert(e);
					},
					Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
					Err(_) => {},
				}
			}

			match first_error {
				Some(e) => Err(e),
				None => Ok(()),
			}
		})
		.await
	}
}
impl<T> TokenBroker<T>
where
	T: HttpTransport,
{
	/// Plain client over the broker transport, bounded by the configured request timeout.
	pub fn transport_client(&self) -> TransportClient {
		TransportClient::new(self.transport.clone()).with_timeout(self.config.request_timeout)
	}

	/// Authorized client over [`TokenBroker::transport_client`], with the broker transport as
	/// default agent.
	pub fn authorized(&self, name: &str) -> Result<AuthorizedClient<TransportClient, T>> {
		Ok(self
			.authorized_client(name, Arc::new(self.transport_client()))?
			.with_agent(self.transport.clone()))
	}
}
#[cfg(feature = "reqwest")]
impl TokenBroker<ReqwestHttpClient> {
	/// Reqwest-backed broker with an in-memory store that exits the process on fatal errors.
	pub fn with_reqwest(config: BrokerConfig) -> Result<Self> {
		let store = Arc::new(MemoryStore::new(config.token_ttl));
		let transport = Arc::new(ReqwestHttpClient::new()?);

		Ok(Self::new(config, store, transport, Arc::new(ProcessExit::default())))
	}
}
impl<T> Debug for TokenBroker<T>
where
	T: ?Sized,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenBroker")
			.field("credentials", &self.config.credentials.keys().collect::<Vec<_>>())
			.field("cache", &self.cache)
			.finish_non_exhaustive()
	}
}

async fn warm_one<T>(
	cache: Arc<AccessTokenCache<T>>,
	credential: Credential,
	policy: BackoffPolicy,
	fatal: Arc<dyn FatalSignal>,
) -> Result<()>
where
	T: ?Sized + HttpTransport,
{
	obs::record_flow_outcome(FlowKind::WarmUp, FlowOutcome::Attempt);

	let persisted = match credential.validate() {
		Ok(()) => cache.store().get(&credential.client_id, &credential.token_endpoint).await?,
		Err(_) => None,
	};

	if let Some(record) = persisted {
		cache.prime(&credential, record);

		return Ok(());
	}

	let record =
		cache.acquirer().acquire_with_backoff(&credential, &policy, fatal.as_ref()).await?;
	let record = cache.persist(record).await?;

	cache.prime(&credential, record);

	Ok(())
}
