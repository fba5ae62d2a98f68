// self
use crate::{breaker::CircuitState, obs::RequestOutcome};

/// Records a request outcome via the global metrics recorder (when enabled).
pub fn record_request_outcome(governor: &str, outcome: RequestOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"request_governor_request_total",
			"governor" => governor.to_owned(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (governor, outcome);
	}
}

/// Records a breaker state transition via the global metrics recorder (when enabled).
pub fn record_breaker_transition(breaker: &str, state: CircuitState) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"request_governor_breaker_transition_total",
			"breaker" => breaker.to_owned(),
			"state" => state.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (breaker, state);
	}
}

/// Records a scheduled retry via the global metrics recorder (when enabled).
pub fn record_retry(governor: &str) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!("request_governor_retry_total", "governor" => governor.to_owned())
			.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = governor;
	}
}

/// Publishes the current adaptive throttle factor via the global metrics recorder (when enabled).
pub fn record_throttle_factor(governor: &str, factor: f64) {
	#[cfg(feature = "metrics")]
	{
		metrics::gauge!("request_governor_throttle_factor", "governor" => governor.to_owned())
			.set(factor);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (governor, factor);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn recorders_noop_without_global_recorder() {
		record_request_outcome("billing", RequestOutcome::Failure);
		record_breaker_transition("billing", CircuitState::Open);
		record_retry("billing");
		record_throttle_factor("billing", 0.75);
	}
}
