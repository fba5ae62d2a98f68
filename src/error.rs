//! Governor-level error types shared across the limiter, breaker, retry loop, and transports.

// self
use crate::{_prelude::*, breaker::CircuitState};

/// Governor-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error returned by user-supplied hooks and transports.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Canonical governor error exposed by public APIs.
///
/// Every terminal condition of [`Governor::execute`](crate::governor::Governor::execute) maps to
/// exactly one variant so callers never have to inspect component-internal types.
#[derive(Debug, ThisError)]
pub enum Error {
	/// The request never got a slot from the limiter.
	#[error(transparent)]
	Admission(#[from] AdmissionError),
	/// The breaker rejected the call without touching the transport.
	#[error(transparent)]
	CircuitOpen(#[from] CircuitOpenError),
	/// Upstream failure that is not worth retrying.
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// Every allowed attempt failed; carries the last failure.
	#[error("Request failed after {attempts} attempts.")]
	RetriesExhausted {
		/// Number of transport invocations that were made.
		attempts: u32,
		/// Failure reported by the final attempt.
		#[source]
		source: UpstreamError,
	},
	/// The caller cancelled the request.
	#[error("Request was cancelled.")]
	Cancelled,
	/// A successful response body did not match the expected shape.
	#[error("Response body returned by HTTP {status} could not be decoded.")]
	Decode {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status of the decoded response.
		status: u16,
	},
}
impl Error {
	/// Returns the HTTP status associated with the failure, if any.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Upstream(e) | Self::RetriesExhausted { source: e, .. } => e.status(),
			Self::Decode { status, .. } => Some(*status),
			_ => None,
		}
	}

	/// Hints how long an outer caller should wait before trying again.
	///
	/// Breaker rejections report the remainder of the recovery window; upstream failures report
	/// the `Retry-After` hint when the remote supplied one.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::CircuitOpen(e) => e.retry_in,
			Self::Upstream(e) | Self::RetriesExhausted { source: e, .. } => e.retry_after(),
			_ => None,
		}
	}
}

/// Failures raised while waiting for limiter admission.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum AdmissionError {
	/// The caller abandoned the wait.
	#[error("Admission was cancelled before capacity became available.")]
	Cancelled,
	/// The admission deadline elapsed.
	#[error("Admission timed out after {waited:?}.")]
	TimedOut {
		/// How long the caller waited.
		waited: Duration,
	},
	/// The limiter is shutting down and drained the queue.
	#[error("Limiter is shut down.")]
	Shutdown,
}

/// Fast-fail raised by [`CircuitBreaker`](crate::breaker::CircuitBreaker) while the circuit is
/// open or the half-open probe quota is exhausted.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Circuit breaker `{breaker}` is {state}; {consecutive_failures} consecutive failures.")]
pub struct CircuitOpenError {
	/// Name of the rejecting breaker.
	pub breaker: String,
	/// State observed when the call was rejected.
	pub state: CircuitState,
	/// Consecutive failures recorded at rejection time.
	pub consecutive_failures: u32,
	/// Wall-clock instant of the most recent failure.
	pub last_failure_at: Option<OffsetDateTime>,
	/// Configured recovery window.
	pub recovery_timeout: Duration,
	/// Remaining time until the breaker will admit a probe, when known.
	pub retry_in: Option<Duration>,
}

/// Transient failure categories that may be retried without a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
	/// The transport deadline elapsed.
	Timeout,
	/// The connection could not be established or was reset.
	Connection,
}

/// Classified failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, ThisError)]
pub enum UpstreamError {
	/// The remote answered with a non-success status.
	#[error("Upstream returned HTTP {status}: {message}.")]
	Status {
		/// HTTP status code.
		status: u16,
		/// Body preview or reason phrase.
		message: String,
		/// `Retry-After` hint, when supplied.
		retry_after: Option<Duration>,
	},
	/// The request did not complete before the transport deadline.
	#[error("Upstream request timed out: {message}.")]
	Timeout {
		/// Transport-supplied detail.
		message: String,
	},
	/// Network failure (DNS, TCP, TLS, reset).
	#[error("Connection to upstream failed.")]
	Connection {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Failure classified by the caller with an explicit retry decision.
	#[error("{message}")]
	Classified {
		/// Human-readable description.
		message: String,
		/// Whether another attempt may succeed.
		retryable: bool,
	},
}
impl UpstreamError {
	/// Builds a [`UpstreamError::Status`] without a `Retry-After` hint.
	pub fn status_code(status: u16, message: impl Into<String>) -> Self {
		Self::Status { status, message: message.into(), retry_after: None }
	}

	/// Wraps a transport-specific network error.
	pub fn connection(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::Connection { source: Box::new(src) }
	}

	/// Builds a caller-classified failure.
	pub fn classified(message: impl Into<String>, retryable: bool) -> Self {
		Self::Classified { message: message.into(), retryable }
	}

	/// HTTP status attached to the failure.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Status { status, .. } => Some(*status),
			_ => None,
		}
	}

	/// `Retry-After` hint attached to the failure.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Status { retry_after, .. } => *retry_after,
			_ => None,
		}
	}

	/// Whether the remote signalled throttling (HTTP 429).
	pub fn is_rejection(&self) -> bool {
		self.status() == Some(429)
	}

	/// Transient category for status-less failures.
	pub fn transient_kind(&self) -> Option<TransientKind> {
		match self {
			Self::Timeout { .. } => Some(TransientKind::Timeout),
			Self::Connection { .. } => Some(TransientKind::Connection),
			_ => None,
		}
	}
}

/// Configuration and validation failures raised by the governor.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Configuration document could not be parsed.
	#[error("Configuration document is malformed.")]
	Parse {
		/// Structured parsing failure naming the offending field path.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// A limit or counter that must be positive was zero.
	#[error("`{field}` must be greater than zero.")]
	Zero {
		/// Offending field name.
		field: &'static str,
	},
	/// A floating-point setting fell outside its accepted range.
	#[error("`{field}` must lie within {range}, got {value}.")]
	OutOfRange {
		/// Offending field name.
		field: &'static str,
		/// Human-readable accepted range.
		range: &'static str,
		/// Rejected value.
		value: f64,
	},
	/// The HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + StdError) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn exhausted_error_exposes_last_failure_as_source() {
		let err = Error::RetriesExhausted {
			attempts: 3,
			source: UpstreamError::Status {
				status: 503,
				message: "maintenance".into(),
				retry_after: Some(Duration::from_secs(7)),
			},
		};

		assert_eq!(err.status(), Some(503));
		assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

		let source =
			StdError::source(&err).expect("Exhausted retries should expose the last failure.");

		assert!(source.to_string().contains("maintenance"));
	}

	#[test]
	fn transient_kinds_cover_status_less_failures() {
		let timeout = UpstreamError::Timeout { message: "read".into() };
		let reset = UpstreamError::connection(std::io::Error::from(
			std::io::ErrorKind::ConnectionReset,
		));

		assert_eq!(timeout.transient_kind(), Some(TransientKind::Timeout));
		assert_eq!(reset.transient_kind(), Some(TransientKind::Connection));
		assert_eq!(UpstreamError::status_code(429, "slow down").transient_kind(), None);
		assert!(UpstreamError::status_code(429, "slow down").is_rejection());
	}
}
