//! Optional observability helpers for governed requests.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `request_governor.request` with the
//!   `governor`, `method`, and `target` fields, plus log events for throttling, breaker
//!   transitions, and retries.
//! - Enable `metrics` to increment `request_governor_request_total` (labeled by `governor` +
//!   `outcome`), `request_governor_breaker_transition_total` (labeled by `breaker` + `state`),
//!   and `request_governor_retry_total`, and to publish the `request_governor_throttle_factor`
//!   gauge.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

#[cfg_attr(feature = "tracing", allow(unused_imports))]
pub(crate) use self::tracing::discard_fields;
pub(crate) use self::tracing::event;

// self
use crate::_prelude::*;

/// Terminal outcome labels recorded for each governed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
	/// The transport returned a response.
	Success,
	/// The request failed upstream (permanently or after exhausting retries).
	Failure,
	/// The breaker rejected the request.
	CircuitOpen,
	/// The limiter never admitted the request.
	Admission,
	/// The caller cancelled the request.
	Cancelled,
}
impl RequestOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RequestOutcome::Success => "success",
			RequestOutcome::Failure => "failure",
			RequestOutcome::CircuitOpen => "circuit_open",
			RequestOutcome::Admission => "admission",
			RequestOutcome::Cancelled => "cancelled",
		}
	}

	pub(crate) fn of<T>(result: &Result<T>) -> Self {
		match result {
			Ok(_) => Self::Success,
			Err(Error::CircuitOpen(_)) => Self::CircuitOpen,
			Err(Error::Admission(_)) => Self::Admission,
			Err(Error::Cancelled) => Self::Cancelled,
			Err(_) => Self::Failure,
		}
	}
}
impl Display for RequestOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
