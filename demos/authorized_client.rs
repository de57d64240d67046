//! Demonstrates an authorized client backed by the reqwest transport and an in-memory store:
//! the first call acquires a token, the second reuses it, and a rejected token is refreshed.

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
// self
use oauth2_token_broker::{
	auth::Credential,
	broker::TokenBroker,
	config::BrokerConfig,
	http::{HttpClient, ReqwestHttpClient, RequestOptions},
	lifecycle::FatalLatch,
	store::MemoryStore,
	url::Url,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/token");
			then.status(200)
				.header("content-type", "application/json")
				.body("{\"access_token\":\"demo-access\"}");
		})
		.await;
	let resource_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/meters").header("authorization", "Bearer demo-access");
			then.status(200).header("content-type", "application/json").body("[1,2,3]");
		})
		.await;
	let mut config = BrokerConfig::default();

	config.credentials.insert(
		"meter".into(),
		Credential::new("demo-client", "super-secret", server.url("/token"))
			.with_scope(["meter.read"])?,
	);

	let store = Arc::new(MemoryStore::new(config.token_ttl));
	let transport = Arc::new(ReqwestHttpClient::new()?);
	let fatal = Arc::new(FatalLatch::new());
	let broker = TokenBroker::new(config, store, transport, fatal);

	broker.warm_up().await?;

	let client = broker.authorized("meter")?;
	let url = Url::parse(&server.url("/meters"))?;

	for _ in 0..2 {
		let response = client.get(url.clone(), RequestOptions::default()).await?;

		println!("Meters: {}.", response.text());
	}

	token_mock.assert_async().await;
	resource_mock.assert_calls_async(2).await;

	Ok(())
}
