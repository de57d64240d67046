//! Immutable token records and their builder.

// self
use crate::{_prelude::*, auth::token::secret::TokenSecret, store};

/// Errors produced by [`TokenRecordBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum TokenRecordBuilderError {
	/// Issued when no access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// Issued when no expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
	/// Issued when `expires_in` reaches past the representable calendar.
	#[error("Relative expiry is out of range.")]
	ExpiryOutOfRange,
}

/// Access token issued for a client identity by a token endpoint.
///
/// Records are never mutated after creation; stores drop them once `expires_at` passes.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
	/// Client identifier the token was issued to.
	pub client_id: String,
	/// Token endpoint that issued the token.
	pub token_endpoint: String,
	/// Access token secret; callers must avoid logging it.
	pub access_token: TokenSecret,
	/// Instant the broker obtained the token.
	pub issued_at: OffsetDateTime,
	/// Instant after which the broker stops using the token.
	pub expires_at: OffsetDateTime,
}
impl TokenRecord {
	/// Returns a builder for the provided client identity.
	pub fn builder(
		client_id: impl Into<String>,
		token_endpoint: impl Into<String>,
	) -> TokenRecordBuilder {
		TokenRecordBuilder::new(client_id.into(), token_endpoint.into())
	}

	/// Returns `true` once `instant` reaches the expiry instant.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		instant >= self.expires_at
	}
}
impl Debug for TokenRecord {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TokenRecord")
			.field("client_id", &self.client_id)
			.field("token_endpoint", &self.token_endpoint)
			.field("access_token", &"<redacted>")
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Builder for [`TokenRecord`].
#[derive(Clone, Debug)]
pub struct TokenRecordBuilder {
	client_id: String,
	token_endpoint: String,
	access_token: Option<TokenSecret>,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl TokenRecordBuilder {
	fn new(client_id: String, token_endpoint: String) -> Self {
		Self {
			client_id,
			token_endpoint,
			access_token: None,
			issued_at: None,
			expires_at: None,
			expires_in: None,
		}
	}

	/// Sets the issued-at instant.
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration from the issued instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(TokenSecret::new(token));

		self
	}

	/// Consumes the builder and produces a [`TokenRecord`].
	pub fn build(self) -> Result<TokenRecord, TokenRecordBuilderError> {
		let access_token = self.access_token.ok_or(TokenRecordBuilderError::MissingAccessToken)?;
		let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => store::expiry_after(issued_at, delta)
				.map_err(|_| TokenRecordBuilderError::ExpiryOutOfRange)?,
			(None, None) => return Err(TokenRecordBuilderError::MissingExpiry),
		};

		Ok(TokenRecord {
			client_id: self.client_id,
			token_endpoint: self.token_endpoint,
			access_token,
			issued_at,
			expires_at,
		})
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	#[test]
	fn expiry_is_inclusive() {
		let record = TokenRecord::builder("123", "https://auth.test/token")
			.access_token("access")
			.issued_at(macros::datetime!(2025-01-01 00:00 UTC))
			.expires_at(macros::datetime!(2025-01-01 01:00 UTC))
			.build()
			.expect("Token record builder should succeed.");

		assert!(!record.is_expired_at(macros::datetime!(2025-01-01 00:59 UTC)));
		assert!(record.is_expired_at(macros::datetime!(2025-01-01 01:00 UTC)));
	}

	#[test]
	fn builder_handles_relative_expiry() {
		let record = TokenRecord::builder("123", "https://auth.test/token")
			.access_token("secret")
			.issued_at(macros::datetime!(2025-01-01 00:00 UTC))
			.expires_in(Duration::from_secs(30 * 60))
			.build()
			.expect("Token record builder should support relative expiry calculations.");

		assert_eq!(record.expires_at, macros::datetime!(2025-01-01 00:30 UTC));
	}

	#[test]
	fn builder_requires_token_and_expiry() {
		let missing_token = TokenRecord::builder("123", "https://auth.test/token")
			.expires_in(Duration::from_secs(60))
			.build();

		assert_eq!(missing_token.err(), Some(TokenRecordBuilderError::MissingAccessToken));

		let missing_expiry =
			TokenRecord::builder("123", "https://auth.test/token").access_token("a").build();

		assert_eq!(missing_expiry.err(), Some(TokenRecordBuilderError::MissingExpiry));

		let overflowing = TokenRecord::builder("123", "https://auth.test/token")
			.access_token("a")
			.expires_in(Duration::MAX)
			.build();

		assert_eq!(overflowing.err(), Some(TokenRecordBuilderError::ExpiryOutOfRange));
	}

	#[test]
	fn debug_output_redacts_the_token() {
		let record = TokenRecord::builder("123", "https://auth.test/token")
			.access_token("very-secret")
			.expires_in(Duration::from_secs(60))
			.build()
			.expect("Token record fixture should build.");

		assert!(!format!("{record:?}").contains("very-secret"));
	}
}
