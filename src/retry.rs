//! Retry orchestration with capped exponential backoff and additive jitter.
//!
//! The delay before retry `k` (0-indexed) is
//! `min(backoff_factor * 2^k, max_delay) * (1 + jitter_factor * r)` with `r` drawn uniformly from
//! `[0, 1)`. Each failure is classified exactly once into a [`FailureClass`]; only
//! [`FailureClass::Retryable`] failures are retried, and never past `max_attempts` retries.

mod metrics;

pub use metrics::{RetryMetrics, RetrySnapshot};

// std
use std::panic::{self, AssertUnwindSafe};
// self
use crate::{
	_prelude::*,
	config::DEFAULT_RETRYABLE_STATUSES,
	error::{BoxError, TransientKind, UpstreamError},
	obs::{self, event},
};

/// Callback invoked before sleeping ahead of a retry; errors and panics are logged and dropped.
pub type RetryHook = Arc<dyn Fn(&RetryAttempt<'_>) -> Result<(), BoxError> + Send + Sync>;

/// Backoff and retryability settings; usually projected from
/// [`GovernorConfig::retry_policy`](crate::config::GovernorConfig::retry_policy).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Retries after the first attempt.
	pub max_attempts: u32,
	/// Base of the exponential backoff, in seconds.
	pub backoff_factor: f64,
	/// Cap on the deterministic part of a delay.
	pub max_delay: Duration,
	/// Fraction of the base delay added as jitter.
	pub jitter_factor: f64,
	/// Retryable HTTP statuses.
	pub retryable_statuses: BTreeSet<u16>,
	/// Retryable status-less failures.
	pub retryable_failures: BTreeSet<TransientKind>,
	/// Whether a `Retry-After` hint may lengthen a delay (never beyond `max_delay`).
	pub honor_retry_after: bool,
}
impl RetryPolicy {
	/// Deterministic part of the delay before retry `retry`.
	pub fn base_delay(&self, retry: u32) -> Duration {
		let secs = self.backoff_factor * 2_f64.powi(retry.min(64) as i32);

		Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX).min(self.max_delay)
	}

	/// Jittered delay before retry `retry`; always within `[base, base * (1 + jitter))`.
	pub fn delay(&self, retry: u32) -> Duration {
		let base = self.base_delay(retry);
		let scale = 1. + self.jitter_factor * rand::random::<f64>();

		Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(base)
	}

	/// Classifies an upstream failure.
	pub fn classify_upstream(&self, err: &UpstreamError) -> FailureClass {
		let retryable = match err {
			UpstreamError::Status { status, .. } => self.retryable_statuses.contains(status),
			UpstreamError::Timeout { .. } | UpstreamError::Connection { .. } =>
				err.transient_kind().is_some_and(|kind| self.retryable_failures.contains(&kind)),
			UpstreamError::Classified { retryable, .. } => *retryable,
		};

		if retryable { FailureClass::Retryable } else { FailureClass::Permanent }
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			backoff_factor: 2.,
			max_delay: Duration::from_secs(60),
			jitter_factor: 0.1,
			retryable_statuses: BTreeSet::from(DEFAULT_RETRYABLE_STATUSES),
			retryable_failures: BTreeSet::from([TransientKind::Timeout, TransientKind::Connection]),
			honor_retry_after: true,
		}
	}
}

/// Retry decision for one failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
	/// Another attempt may succeed.
	Retryable,
	/// Retrying cannot help.
	Permanent,
	/// The operation was cancelled; stop without retrying.
	Cancelled,
}

/// Errors the orchestrator knows how to classify.
pub trait Classify {
	/// Classifies `self` under `policy`.
	fn classify(&self, policy: &RetryPolicy) -> FailureClass;

	/// Minimum wait requested by the remote, if any.
	fn retry_after(&self) -> Option<Duration> {
		None
	}
}
impl Classify for UpstreamError {
	fn classify(&self, policy: &RetryPolicy) -> FailureClass {
		policy.classify_upstream(self)
	}

	fn retry_after(&self) -> Option<Duration> {
		UpstreamError::retry_after(self)
	}
}

/// Context handed to retry hooks before the orchestrator sleeps.
#[derive(Debug)]
pub struct RetryAttempt<'a> {
	/// Retry about to be made (1 for the first retry).
	pub attempt_number: u32,
	/// Delay before the retry.
	pub delay: Duration,
	/// Failure that triggered the retry.
	pub last_error: &'a (dyn StdError + 'a),
}

/// Terminal outcome of [`RetryOrchestrator::execute_with_retry`].
#[derive(Debug, ThisError)]
pub enum RetryError<E> {
	/// A failure that must not be retried.
	#[error(transparent)]
	Permanent(E),
	/// Every allowed attempt failed.
	#[error("Gave up after {attempts} attempts.")]
	Exhausted {
		/// Invocations made.
		attempts: u32,
		/// Failure of the final attempt.
		#[source]
		last: E,
	},
	/// The operation was cancelled.
	#[error("Retry loop was cancelled.")]
	Cancelled,
}

/// Re-runs failing operations according to a [`RetryPolicy`].
pub struct RetryOrchestrator {
	name: String,
	policy: RetryPolicy,
	hooks: Vec<RetryHook>,
	metrics: Arc<RetryMetrics>,
}
impl RetryOrchestrator {
	/// Creates an orchestrator; `name` labels logs and metrics.
	pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
		Self { name: name.into(), policy, hooks: Vec::new(), metrics: Default::default() }
	}

	/// Registers a hook invoked before each retry sleep; hook errors are logged and dropped.
	pub fn with_on_retry<F>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(&RetryAttempt<'_>) -> Result<(), BoxError>,
	{
		self.hooks.push(Arc::new(hook));

		self
	}

	/// Active policy.
	pub fn policy(&self) -> &RetryPolicy {
		&self.policy
	}

	/// Shared retry counters.
	pub fn metrics(&self) -> Arc<RetryMetrics> {
		Arc::clone(&self.metrics)
	}

	/// Runs `op` until it succeeds, fails permanently, exhausts its retries, or is cancelled.
	///
	/// `op` receives the 0-indexed attempt number. At most `max_attempts + 1` invocations are made.
	/// Cancelling `cancel` interrupts both in-flight attempts and backoff sleeps.
	pub async fn execute_with_retry<F, Fut, T, E>(
		&self,
		cancel: Option<&CancellationToken>,
		mut op: F,
	) -> Result<T, RetryError<E>>
	where
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: Classify + StdError,
	{
		let mut attempt = 0;

		loop {
			if cancel.is_some_and(|token| token.is_cancelled()) {
				return Err(RetryError::Cancelled);
			}

			let result = match cancel {
				Some(token) => tokio::select! {
					biased;
					_ = token.cancelled() => return Err(RetryError::Cancelled),
					result = op(attempt) => result,
				},
				None => op(attempt).await,
			};
			let err = match result {
				Ok(value) => {
					if attempt > 0 {
						self.metrics.record_recovered();
					}

					return Ok(value);
				},
				Err(err) => err,
			};

			match err.classify(&self.policy) {
				FailureClass::Cancelled => return Err(RetryError::Cancelled),
				FailureClass::Permanent => {
					if attempt > 0 {
						self.metrics.record_exhausted();
					}

					return Err(RetryError::Permanent(err));
				},
				FailureClass::Retryable if attempt >= self.policy.max_attempts => {
					if attempt > 0 {
						self.metrics.record_exhausted();
					}

					event!(
						ERROR,
						retrier = %self.name,
						attempts = attempt + 1,
						error = %err,
						"Retries exhausted."
					);

					return Err(RetryError::Exhausted { attempts: attempt + 1, last: err });
				},
				FailureClass::Retryable => {},
			}

			let delay = self.next_delay(attempt, &err);

			attempt += 1;

			self.metrics.record_retry();
			obs::record_retry(&self.name);

			event!(
				WARN,
				retrier = %self.name,
				attempt,
				delay_ms = delay.as_millis() as u64,
				error = %err,
				"Retrying after failure."
			);

			self.run_hooks(&RetryAttempt { attempt_number: attempt, delay, last_error: &err });

			match cancel {
				Some(token) => tokio::select! {
					biased;
					_ = token.cancelled() => return Err(RetryError::Cancelled),
					_ = tokio::time::sleep(delay) => {},
				},
				None => tokio::time::sleep(delay).await,
			}
		}
	}

	fn run_hooks(&self, context: &RetryAttempt<'_>) {
		for hook in &self.hooks {
			match panic::catch_unwind(AssertUnwindSafe(|| hook(context))) {
				Ok(Ok(())) => {},
				Ok(Err(e)) => event!(ERROR, retrier = %self.name, error = %e, "Retry hook failed."),
				Err(_) => event!(ERROR, retrier = %self.name, "Retry hook panicked."),
			}
		}
	}

	fn next_delay<E>(&self, retry: u32, err: &E) -> Duration
	where
		E: Classify,
	{
		let delay = self.policy.delay(retry);

		match err.retry_after() {
			Some(hint) if self.policy.honor_retry_after =>
				delay.max(hint.min(self.policy.max_delay)),
			_ => delay,
		}
	}
}
impl Debug for RetryOrchestrator {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RetryOrchestrator")
			.field("name", &self.name)
			.field("policy", &self.policy)
			.field("hooks", &self.hooks.len())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::sync::atomic::{AtomicU32, Ordering};
	// self
	use super::*;

	fn fast_policy(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			backoff_factor: 0.01,
			max_delay: Duration::from_millis(50),
			..Default::default()
		}
	}

	#[test]
	fn base_delay_doubles_until_capped() {
		let policy = RetryPolicy {
			backoff_factor: 1.,
			max_delay: Duration::from_secs(10),
			..Default::default()
		};
		let bases = (0..6).map(|k| policy.base_delay(k).as_secs()).collect::<Vec<_>>();

		assert_eq!(bases, vec![1, 2, 4, 8, 10, 10]);
	}

	#[test]
	fn classification_follows_policy_sets() {
		let policy = RetryPolicy {
			retryable_failures: BTreeSet::from([TransientKind::Timeout]),
			..Default::default()
		};
		let reset = UpstreamError::connection(std::io::Error::from(
			std::io::ErrorKind::ConnectionReset,
		));

		assert_eq!(
			policy.classify_upstream(&UpstreamError::status_code(503, "busy")),
			FailureClass::Retryable
		);
		assert_eq!(
			policy.classify_upstream(&UpstreamError::status_code(404, "missing")),
			FailureClass::Permanent
		);
		assert_eq!(
			policy.classify_upstream(&UpstreamError::Timeout { message: "read".into() }),
			FailureClass::Retryable
		);
		assert_eq!(policy.classify_upstream(&reset), FailureClass::Permanent);
		assert_eq!(
			policy.classify_upstream(&UpstreamError::classified("quota", true)),
			FailureClass::Retryable
		);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_after_hint_stretches_delay_up_to_cap() {
		let orchestrator = RetryOrchestrator::new(
			"test",
			RetryPolicy { max_delay: Duration::from_secs(5), ..fast_policy(1) },
		);
		let hinted = UpstreamError::Status {
			status: 429,
			message: "slow down".into(),
			retry_after: Some(Duration::from_secs(3)),
		};
		let excessive = UpstreamError::Status {
			status: 429,
			message: "slow down".into(),
			retry_after: Some(Duration::from_secs(600)),
		};

		assert_eq!(orchestrator.next_delay(0, &hinted), Duration::from_secs(3));
		assert_eq!(orchestrator.next_delay(0, &excessive), Duration::from_secs(5));
	}

	#[tokio::test(start_paused = true)]
	async fn hooks_see_each_retry_and_errors_are_swallowed() {
		let seen = Arc::new(AtomicU32::new(0));
		let orchestrator = {
			let seen = Arc::clone(&seen);

			RetryOrchestrator::new("test", fast_policy(2)).with_on_retry(move |attempt| {
				seen.fetch_add(1, Ordering::SeqCst);

				assert!(attempt.last_error.to_string().contains("busy"));

				Err("hook failure".into())
			})
		};
		let result = orchestrator
			.execute_with_retry(None, |_| async {
				Err::<(), _>(UpstreamError::status_code(503, "busy"))
			})
			.await;

		assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
		assert_eq!(seen.load(Ordering::SeqCst), 2);

		let metrics = orchestrator.metrics();

		assert_eq!(metrics.retries(), 2);
		assert_eq!(metrics.failed_retries(), 1);
		assert_eq!(metrics.success_rate(), 0.);
	}

	#[tokio::test(start_paused = true)]
	async fn panicking_hooks_do_not_abort_the_loop() {
		let orchestrator = RetryOrchestrator::new("test", fast_policy(2))
			.with_on_retry(|_| panic!("retry hook blew up"));
		let calls = AtomicU32::new(0);
		let result = orchestrator
			.execute_with_retry(None, |attempt| {
				calls.fetch_add(1, Ordering::SeqCst);

				async move {
					if attempt < 2 {
						Err(UpstreamError::status_code(503, "busy"))
					} else {
						Ok(attempt)
					}
				}
			})
			.await;

		assert_eq!(result.expect("Third attempt should succeed."), 2);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}
}
