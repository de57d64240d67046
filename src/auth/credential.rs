//! Client-credentials identity and its cache key derivation.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{
	_prelude::*,
	auth::{ScopeList, ScopeValidationError, TokenSecret},
	error::ValidationError,
};

const DEFAULT_GRANT_TYPE: &str = "client_credentials";

/// Identity used to request a token from an authorization server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
	/// OAuth client identifier.
	#[serde(default)]
	pub client_id: String,
	/// OAuth client secret.
	#[serde(default)]
	pub client_secret: TokenSecret,
	/// Absolute token endpoint URL.
	#[serde(default)]
	pub token_endpoint: String,
	/// Grant type sent with the token request.
	#[serde(default = "default_grant_type")]
	pub grant_type: String,
	/// Ordered scopes requested for the token.
	#[serde(default)]
	pub scope: ScopeList,
	/// Optional audience forwarded to the token endpoint.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub audience: Option<String>,
}
impl Credential {
	/// Creates a client-credentials identity without scopes.
	pub fn new(
		client_id: impl Into<String>,
		client_secret: impl Into<TokenSecret>,
		token_endpoint: impl Into<String>,
	) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: client_secret.into(),
			token_endpoint: token_endpoint.into(),
			grant_type: default_grant_type(),
			scope: ScopeList::default(),
			audience: None,
		}
	}

	/// Replaces the requested scopes.
	pub fn with_scope<I, S>(mut self, scopes: I) -> Result<Self, ScopeValidationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.scope = ScopeList::new(scopes)?;

		Ok(self)
	}

	/// Overrides the grant type.
	pub fn with_grant_type(mut self, grant_type: impl Into<String>) -> Self {
		self.grant_type = grant_type.into();

		self
	}

	/// Sets the audience parameter.
	pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
		self.audience = Some(audience.into());

		self
	}

	/// Checks required fields in declaration order, then the endpoint URL.
	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.client_id.is_empty() {
			return Err(ValidationError::MissingField { field: "client_id" });
		}
		if self.client_secret.is_empty() {
			return Err(ValidationError::MissingField { field: "client_secret" });
		}
		if self.token_endpoint.is_empty() {
			return Err(ValidationError::MissingField { field: "token_endpoint" });
		}

		self.token_url().map(|_| ())
	}

	/// Parses the token endpoint.
	pub fn token_url(&self) -> Result<Url, ValidationError> {
		Url::parse(&self.token_endpoint).map_err(|source| {
			ValidationError::InvalidTokenEndpoint { value: self.token_endpoint.clone(), source }
		})
	}

	/// Cache identity of this credential.
	///
	/// The key covers `(client_id, token_endpoint, grant_type, scope)`. The secret is left out,
	/// so credentials differing only by secret share one cached token.
	pub fn cache_key(&self) -> CacheKey {
		let canonical = serde_json::json!([
			self.client_id,
			self.token_endpoint,
			self.grant_type,
			self.scope.as_slice(),
		])
		.to_string();
		let digest = Sha256::digest(canonical.as_bytes());

		CacheKey(STANDARD_NO_PAD.encode(digest))
	}
}

/// Stable in-process cache identity derived from a [`Credential`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);
impl CacheKey {
	/// Base64 (no padding) SHA-256 digest backing the key.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Display for CacheKey {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}

fn default_grant_type() -> String {
	DEFAULT_GRANT_TYPE.into()
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn credential() -> Credential {
		Credential::new("123", "456", "https://auth.test/token")
			.with_scope(["meter"])
			.expect("Scope fixture should be valid.")
	}

	#[test]
	fn validation_reports_first_missing_field() {
		let mut missing = credential();

		missing.client_id.clear();
		missing.client_secret = TokenSecret::default();

		assert_eq!(missing.validate(), Err(ValidationError::MissingField { field: "client_id" }));

		missing.client_id = "123".into();

		assert_eq!(missing.validate(), Err(ValidationError::MissingField { field: "client_secret" }));

		let relative = Credential::new("123", "456", "/token");

		assert!(matches!(
			relative.validate(),
			Err(ValidationError::InvalidTokenEndpoint { .. })
		));
		assert!(credential().validate().is_ok());
	}

	#[test]
	fn cache_key_ignores_the_secret() {
		let mut rotated = credential();

		rotated.client_secret = TokenSecret::new("rotated");

		assert_eq!(credential().cache_key(), rotated.cache_key());
	}

	#[test]
	fn cache_key_tracks_identity_fields() {
		let base = credential().cache_key();

		assert_ne!(base, credential().with_grant_type("password").cache_key());
		assert_ne!(
			base,
			credential().with_scope(["meter", "read"]).expect("Scopes should be valid.").cache_key()
		);

		let mut other_endpoint = credential();

		other_endpoint.token_endpoint = "https://auth.test/other".into();

		assert_ne!(base, other_endpoint.cache_key());
	}

	#[test]
	fn deserializes_with_defaults() {
		let parsed: Credential = serde_json::from_str(
			r#"{"client_id":"123","client_secret":"456","token_endpoint":"https://auth.test/token","scope":"meter"}"#,
		)
		.expect("Credential JSON should parse.");

		assert_eq!(parsed, credential());
		assert_eq!(parsed.grant_type, "client_credentials");
		assert!(!format!("{parsed:?}").contains("456"));
	}
}
