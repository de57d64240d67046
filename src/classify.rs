//! Classification of authorization failures.
//!
//! Both predicates are total: any error shape they do not recognise, including a malformed or
//! missing response body, simply yields the conservative answer.

// self
use crate::{_prelude::*, error::UpstreamError};

const CONSTRAINT_ERROR: &str = "ConstraintError";
const NOT_ALLOWED_ERROR: &str = "NotAllowedError";
const INVALID_TOKEN: &str = "invalid_token";
const TEMPORARILY_UNAVAILABLE: &str = "temporarily_unavailable";

/// Returns `true` when a protected resource rejected the presented access token.
///
/// The answer must be HTTP 401 and its body must carry one of: an `errors[]` entry named
/// `ConstraintError`, a top-level `name` of `ConstraintError` or `NotAllowedError`, or an OAuth
/// `error` code of `invalid_token`.
pub fn is_invalid_access_token_error(error: &Error) -> bool {
	error.upstream().is_some_and(is_invalid_access_token_response)
}

/// [`is_invalid_access_token_error`] over a bare upstream answer.
pub fn is_invalid_access_token_response(upstream: &UpstreamError) -> bool {
	if upstream.status != 401 {
		return false;
	}

	upstream.listed_error_names().any(|name| name == CONSTRAINT_ERROR)
		|| matches!(upstream.error_name(), Some(CONSTRAINT_ERROR | NOT_ALLOWED_ERROR))
		|| upstream.error_code() == Some(INVALID_TOKEN)
}

/// Returns `true` when retrying the failed token acquisition cannot succeed.
///
/// Upstream answers carrying an OAuth `error` code are unrecoverable unless the code is
/// `temporarily_unavailable` or the answer is an `invalid_token` + `ConstraintError` pair.
/// Answers without a code fall back to the status: 408, 429 and 5xx are recoverable.
/// Network failures, timeouts, non-token answers and exhausted bounded acquisitions are
/// recoverable; invalid configuration is not.
pub fn is_unrecoverable_error(error: &Error) -> bool {
	match error {
		Error::Upstream(upstream) => is_unrecoverable_response(upstream),
		Error::Validation(_) | Error::Config(_) | Error::Unrecoverable { .. } => true,
		Error::ServiceUnavailable { last_error: Some(last), .. } => is_unrecoverable_error(last),
		Error::RefreshExhausted { source, .. } => is_unrecoverable_error(source),
		Error::Transport(_)
		| Error::Transient(_)
		| Error::Storage(_)
		| Error::ServiceUnavailable { last_error: None, .. } => false,
	}
}

fn is_unrecoverable_response(upstream: &UpstreamError) -> bool {
	match upstream.error_code() {
		Some(code) =>
			!(code == TEMPORARILY_UNAVAILABLE
				|| (code == INVALID_TOKEN && upstream.error_name() == Some(CONSTRAINT_ERROR))),
		None => !matches!(upstream.status, 408 | 429 | 500..=599),
	}
}
