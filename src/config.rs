//! Flat configuration surface for a [`Governor`](crate::governor::Governor).
//!
//! Every field has a conservative default, so partial JSON documents are accepted:
//!
//! ```
//! use request_governor::config::GovernorConfig;
//!
//! let config = GovernorConfig::from_json_str(r#"{ "per_second_limit": 2 }"#).unwrap();
//!
//! assert_eq!(config.per_second_limit, 2);
//! assert_eq!(config.per_minute_limit, 360);
//! ```

// self
use crate::{
	_prelude::*,
	breaker::BreakerConfig,
	error::{ConfigError, TransientKind},
	limiter::LimiterConfig,
	retry::RetryPolicy,
};

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Tunables for one governed target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernorConfig {
	/// Short-horizon tier capacity and refill rate (requests per second).
	pub per_second_limit: u32,
	/// Long-horizon tier capacity (requests per minute).
	pub per_minute_limit: u32,
	/// Admissions allowed inside one burst window.
	pub burst_size: u32,
	/// Burst window length in milliseconds.
	pub burst_window_ms: u64,
	/// Lowest throttle factor reachable through upstream rejections.
	pub throttle_floor: f64,
	/// Whether upstream rejections slow the limiter down.
	pub adaptive_throttling: bool,
	/// How often an idle admission loop wakes without a new ticket.
	pub idle_poll_interval_ms: u64,
	/// Upper bound on how long one attempt may wait for admission.
	pub admission_timeout_ms: Option<u64>,

	/// Whether calls are wrapped in a circuit breaker.
	pub circuit_breaker_enabled: bool,
	/// Consecutive failures that open the circuit.
	pub failure_threshold: u32,
	/// Seconds the circuit stays open before admitting probes.
	pub recovery_timeout_sec: u64,
	/// Probes admitted (and successes required) while half-open.
	pub half_open_max_calls: u32,
	/// Whether non-retryable upstream failures count toward opening the circuit.
	pub permanent_failures_trip_breaker: bool,

	/// Retries after the first attempt.
	pub max_retry_attempts: u32,
	/// Base of the exponential backoff, in seconds.
	pub backoff_factor: f64,
	/// Cap on the deterministic part of a retry delay, in seconds.
	pub max_delay_sec: f64,
	/// Fraction of the base delay added as random jitter.
	pub jitter_factor: f64,
	/// HTTP statuses considered retryable.
	pub retryable_status_codes: BTreeSet<u16>,
	/// Status-less failures considered retryable.
	pub retryable_failures: BTreeSet<TransientKind>,
	/// Whether a `Retry-After` hint may lengthen the next delay.
	pub honor_retry_after: bool,
}
impl GovernorConfig {
	/// Parses and validates a JSON document.
	pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
		let mut de = serde_json::Deserializer::from_str(raw);
		let config: Self = serde_path_to_error::deserialize(&mut de)
			.map_err(|source| ConfigError::Parse { source })?;

		config.validate()?;

		Ok(config)
	}

	/// Rejects values that would stall or break a component.
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (field, value) in [
			("per_second_limit", self.per_second_limit as u64),
			("per_minute_limit", self.per_minute_limit as u64),
			("burst_size", self.burst_size as u64),
			("burst_window_ms", self.burst_window_ms),
			("idle_poll_interval_ms", self.idle_poll_interval_ms),
			("failure_threshold", self.failure_threshold as u64),
			("half_open_max_calls", self.half_open_max_calls as u64),
		] {
			if value == 0 {
				return Err(ConfigError::Zero { field });
			}
		}

		if !(self.throttle_floor > 0. && self.throttle_floor <= 1.) {
			return Err(ConfigError::OutOfRange {
				field: "throttle_floor",
				range: "(0, 1]",
				value: self.throttle_floor,
			});
		}

		for (field, value) in [
			("backoff_factor", self.backoff_factor),
			("max_delay_sec", self.max_delay_sec),
			("jitter_factor", self.jitter_factor),
		] {
			if !value.is_finite() || value < 0. {
				return Err(ConfigError::OutOfRange { field, range: "[0, inf)", value });
			}
		}

		Ok(())
	}

	/// Limiter settings derived from this configuration.
	pub fn limiter_config(&self) -> LimiterConfig {
		LimiterConfig {
			per_second_limit: self.per_second_limit,
			per_minute_limit: self.per_minute_limit,
			burst_size: self.burst_size,
			burst_window: Duration::from_millis(self.burst_window_ms),
			throttle_floor: self.throttle_floor,
			adaptive_throttling: self.adaptive_throttling,
			idle_poll_interval: Duration::from_millis(self.idle_poll_interval_ms),
		}
	}

	/// Breaker settings derived from this configuration.
	pub fn breaker_config(&self) -> BreakerConfig {
		BreakerConfig {
			failure_threshold: self.failure_threshold,
			recovery_timeout: Duration::from_secs(self.recovery_timeout_sec),
			half_open_max_calls: self.half_open_max_calls,
		}
	}

	/// Retry policy derived from this configuration.
	pub fn retry_policy(&self) -> RetryPolicy {
		RetryPolicy {
			max_attempts: self.max_retry_attempts,
			backoff_factor: self.backoff_factor,
			max_delay: Duration::try_from_secs_f64(self.max_delay_sec).unwrap_or(Duration::MAX),
			jitter_factor: self.jitter_factor,
			retryable_statuses: self.retryable_status_codes.clone(),
			retryable_failures: self.retryable_failures.clone(),
			honor_retry_after: self.honor_retry_after,
		}
	}

	/// Admission deadline for a single attempt, when configured.
	pub fn admission_timeout(&self) -> Option<Duration> {
		self.admission_timeout_ms.map(Duration::from_millis)
	}
}
impl Default for GovernorConfig {
	fn default() -> Self {
		Self {
			per_second_limit: 6,
			per_minute_limit: 360,
			burst_size: 3,
			burst_window_ms: 500,
			throttle_floor: 0.25,
			adaptive_throttling: true,
			idle_poll_interval_ms: 1_000,
			admission_timeout_ms: None,
			circuit_breaker_enabled: true,
			failure_threshold: 5,
			recovery_timeout_sec: 60,
			half_open_max_calls: 3,
			permanent_failures_trip_breaker: false,
			max_retry_attempts: 3,
			backoff_factor: 2.,
			max_delay_sec: 60.,
			jitter_factor: 0.1,
			retryable_status_codes: BTreeSet::from(DEFAULT_RETRYABLE_STATUSES),
			retryable_failures: BTreeSet::from([TransientKind::Timeout, TransientKind::Connection]),
			honor_retry_after: true,
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn defaults_are_valid() {
		let config = GovernorConfig::default();

		config.validate().expect("Default configuration should validate.");

		assert!(config.retryable_status_codes.contains(&429));
		assert_eq!(config.limiter_config().burst_window, Duration::from_millis(500));
		assert_eq!(config.breaker_config().recovery_timeout, Duration::from_secs(60));
		assert_eq!(config.retry_policy().max_attempts, 3);
	}

	#[test]
	fn parse_errors_name_the_offending_field() {
		let err = GovernorConfig::from_json_str(r#"{ "failure_threshold": "five" }"#)
			.expect_err("A string threshold should be rejected.");

		match err {
			ConfigError::Parse { source } => {
				assert_eq!(source.path().to_string(), "failure_threshold");
			},
			other => panic!("Unexpected error: {other:?}."),
		}
	}

	#[test]
	fn validation_rejects_stalling_values() {
		let zero = GovernorConfig { per_minute_limit: 0, ..Default::default() };

		assert!(matches!(
			zero.validate(),
			Err(ConfigError::Zero { field: "per_minute_limit" })
		));

		let floor = GovernorConfig { throttle_floor: 0., ..Default::default() };

		assert!(matches!(
			floor.validate(),
			Err(ConfigError::OutOfRange { field: "throttle_floor", .. })
		));

		let jitter = GovernorConfig { jitter_factor: f64::NAN, ..Default::default() };

		assert!(matches!(
			jitter.validate(),
			Err(ConfigError::OutOfRange { field: "jitter_factor", .. })
		));
	}

	#[test]
	fn statuses_and_failures_deserialize_from_lists() {
		let config = GovernorConfig::from_json_str(
			r#"{ "retryable_status_codes": [503], "retryable_failures": ["timeout"] }"#,
		)
		.expect("Lists should deserialize into sets.");

		assert_eq!(config.retryable_status_codes, BTreeSet::from([503]));
		assert_eq!(config.retryable_failures, BTreeSet::from([TransientKind::Timeout]));
	}
}
