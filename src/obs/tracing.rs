// self
use crate::{_prelude::*, obs::FlowKind};

/// Type alias that resolves to an instrumented future when tracing is enabled.
#[cfg(feature = "tracing")]
pub type InstrumentedFlow<F> = tracing::instrument::Instrumented<F>;
/// Passthrough future type when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub type InstrumentedFlow<F> = F;

/// A span builder used by broker flows.
#[derive(Clone, Debug)]
pub struct FlowSpan {
	#[cfg(feature = "tracing")]
	span: tracing::Span,
}
impl FlowSpan {
	/// Creates a new span tagged with the provided flow kind + stage.
	pub fn new(kind: FlowKind, stage: &'static str) -> Self {
		#[cfg(feature = "tracing")]
		{
			let span = tracing::info_span!("oauth2_token_broker.flow", flow = kind.as_str(), stage);

			Self { span }
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = (kind, stage);

			Self {}
		}
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedFlow<Fut>
	where
		Fut: Future,
	{
		#[cfg(feature = "tracing")]
		{
			use tracing::Instrument;

			fut.instrument(self.span.clone())
		}
		#[cfg(not(feature = "tracing"))]
		{
			fut
		}
	}
}

/// Logs a failed token acquisition attempt at error level.
pub fn log_attempt_failure(kind: FlowKind, client_id: &str, attempt: u32, error: &Error) {
	#[cfg(feature = "tracing")]
	{
		tracing::error!(flow = kind.as_str(), client_id, attempt, %error, "Token acquisition attempt failed.");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (kind, client_id, attempt, error);
	}
}

/// Logs an unrecoverable failure right before the fatal signal fires.
pub fn log_fatal(error: &Error) {
	#[cfg(feature = "tracing")]
	{
		tracing::error!(%error, "Unrecoverable authorization failure; signalling fatal exit.");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = error;
	}
}

/// Logs the start of a refresh-and-retry cycle at debug level.
pub fn log_refresh_retry(client_id: &str, error: &Error) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(client_id, %error, "Access token rejected; refreshing and retrying once.");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (client_id, error);
	}
}

/// Logs the wait before the next backoff-mode attempt at debug level.
pub fn log_backoff_delay(client_id: &str, delay: Duration) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(client_id, ?delay, "Retrying token acquisition after backoff.");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (client_id, delay);
	}
}
