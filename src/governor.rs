//! Composition root that routes every request through limiter, breaker, transport, and retries.
//!
//! One [`Governor`] exists per remote target and is shared by reference (or `Arc`) among all
//! callers. Each attempt of [`Governor::execute`] waits for limiter admission, then runs the
//! transport inside the circuit breaker; failures are classified once and handed to the retry
//! orchestrator. HTTP 429 responses slow the limiter down and successes ease it back up.

// self
use crate::{
	_prelude::*,
	breaker::{BreakerError, BreakerSnapshot, CircuitBreaker},
	config::GovernorConfig,
	error::{AdmissionError, BoxError, CircuitOpenError, UpstreamError},
	limiter::{DualTierLimiter, LimiterSnapshot},
	obs::{self, RequestOutcome, RequestSpan, event},
	retry::{
		Classify, FailureClass, RetryAttempt, RetryError, RetryMetrics, RetryOrchestrator,
		RetryPolicy, RetrySnapshot,
	},
	transport::{RequestDescriptor, Response, Transport},
};

/// Read-only view across the governor's components.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GovernorMetrics {
	/// Governor name.
	pub governor: String,
	/// Limiter counters and levels.
	pub limiter: LimiterSnapshot,
	/// Breaker state and counters, when a breaker is attached.
	pub breaker: Option<BreakerSnapshot>,
	/// Retry counters.
	pub retry: RetrySnapshot,
}

/// Resilient front for one remote target.
pub struct Governor<T>
where
	T: ?Sized + Transport,
{
	name: String,
	config: GovernorConfig,
	transport: Arc<T>,
	limiter: DualTierLimiter,
	breaker: Option<Arc<CircuitBreaker>>,
	retry: RetryOrchestrator,
}
impl<T> Governor<T>
where
	T: ?Sized + Transport,
{
	/// Validates `config` and builds the limiter, breaker, and retry orchestrator it describes.
	pub fn new(name: impl Into<String>, config: GovernorConfig, transport: Arc<T>) -> Result<Self> {
		config.validate()?;

		let name = name.into();
		let limiter = DualTierLimiter::new(name.clone(), config.limiter_config());
		let breaker = config
			.circuit_breaker_enabled
			.then(|| Arc::new(CircuitBreaker::new(name.clone(), config.breaker_config())));
		let retry = RetryOrchestrator::new(name.clone(), config.retry_policy());

		Ok(Self { name, config, transport, limiter, breaker, retry })
	}

	/// Replaces the breaker, for example with one shared through a
	/// [`BreakerRegistry`](crate::breaker::BreakerRegistry) or carrying hooks.
	pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
		self.breaker = Some(breaker);

		self
	}

	/// Registers a hook invoked before each retry sleep.
	pub fn with_on_retry<F>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(&RetryAttempt<'_>) -> Result<(), BoxError>,
	{
		self.retry = self.retry.with_on_retry(hook);

		self
	}

	/// Governor name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Active configuration.
	pub fn config(&self) -> &GovernorConfig {
		&self.config
	}

	/// Underlying transport.
	pub fn transport(&self) -> &Arc<T> {
		&self.transport
	}

	/// Limiter owned by this governor.
	pub fn limiter(&self) -> &DualTierLimiter {
		&self.limiter
	}

	/// Breaker guarding the transport, if enabled.
	pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
		self.breaker.as_ref()
	}

	/// Retry counters.
	pub fn retry_metrics(&self) -> Arc<RetryMetrics> {
		self.retry.metrics()
	}

	/// Executes `request` under rate limiting, circuit breaking, and retries.
	///
	/// Returns the first successful response, or exactly one terminal [`Error`]:
	/// [`Error::Admission`], [`Error::CircuitOpen`], [`Error::Upstream`] for permanent failures,
	/// [`Error::RetriesExhausted`], or [`Error::Cancelled`].
	pub async fn execute(&self, request: RequestDescriptor) -> Result<Response> {
		let span = RequestSpan::new(&self.name, request.method, &request.target);
		let result = span.instrument(self.execute_inner(&request)).await;

		obs::record_request_outcome(&self.name, RequestOutcome::of(&result));

		result
	}

	/// Captures limiter, breaker, and retry state.
	pub fn metrics(&self) -> GovernorMetrics {
		GovernorMetrics {
			governor: self.name.clone(),
			limiter: self.limiter.snapshot(),
			breaker: self.breaker.as_ref().map(|breaker| breaker.snapshot()),
			retry: self.retry.metrics().snapshot(),
		}
	}

	/// Shuts the limiter down; queued and future requests fail with [`AdmissionError::Shutdown`].
	pub async fn shutdown(&self) {
		self.limiter.shutdown().await;

		event!(INFO, governor = %self.name, "Governor shut down.");
	}

	async fn execute_inner(&self, request: &RequestDescriptor) -> Result<Response> {
		let admission_timeout = request.admission_timeout.or(self.config.admission_timeout());
		let result = self
			.retry
			.execute_with_retry(request.cancel.as_ref(), move |attempt| {
				self.attempt(request, attempt, admission_timeout)
			})
			.await;

		match result {
			Ok(response) => Ok(response),
			Err(RetryError::Cancelled) => Err(Error::Cancelled),
			Err(RetryError::Permanent(e)) => Err(e.into()),
			Err(RetryError::Exhausted { attempts, last: AttemptError::Upstream(source) }) =>
				Err(Error::RetriesExhausted { attempts, source }),
			Err(RetryError::Exhausted { last, .. }) => Err(last.into()),
		}
	}

	async fn attempt(
		&self,
		request: &RequestDescriptor,
		attempt: u32,
		admission_timeout: Option<Duration>,
	) -> Result<Response, AttemptError> {
		self.limiter
			.acquire_with(request.priority, admission_timeout, request.cancel.as_ref())
			.await
			.map_err(AttemptError::Admission)?;

		event!(DEBUG, governor = %self.name, attempt, "Dispatching request.");

		let result = match &self.breaker {
			Some(breaker) => breaker
				.call_classified(|| self.transport.send(request), |e| self.trips_breaker(e))
				.await
				.map_err(|e| match e {
					BreakerError::Open(e) => AttemptError::CircuitOpen(e),
					BreakerError::Inner(e) => AttemptError::Upstream(e),
				}),
			None => self.transport.send(request).await.map_err(AttemptError::Upstream),
		};

		match &result {
			Ok(_) => self.limiter.report_success(),
			Err(AttemptError::Upstream(e)) if e.is_rejection() => self.limiter.report_rejection(),
			_ => {},
		}

		result
	}

	fn trips_breaker(&self, err: &UpstreamError) -> bool {
		self.config.permanent_failures_trip_breaker
			|| self.retry.policy().classify_upstream(err) == FailureClass::Retryable
	}
}
impl<T> Debug for Governor<T>
where
	T: ?Sized + Transport,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Governor")
			.field("name", &self.name)
			.field("limiter", &self.limiter)
			.field("breaker", &self.breaker)
			.field("retry", &self.retry)
			.finish_non_exhaustive()
	}
}

/// Failure of one governed attempt, before retry classification.
#[derive(Debug, ThisError)]
enum AttemptError {
	#[error(transparent)]
	Admission(AdmissionError),
	#[error(transparent)]
	CircuitOpen(CircuitOpenError),
	#[error(transparent)]
	Upstream(UpstreamError),
}
impl Classify for AttemptError {
	fn classify(&self, policy: &RetryPolicy) -> FailureClass {
		match self {
			Self::Admission(AdmissionError::Cancelled) => FailureClass::Cancelled,
			// Retrying into a full queue or an open circuit cannot help within this call.
			Self::Admission(_) | Self::CircuitOpen(_) => FailureClass::Permanent,
			Self::Upstream(e) => policy.classify_upstream(e),
		}
	}

	fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Upstream(e) => e.retry_after(),
			_ => None,
		}
	}
}
impl From<AttemptError> for Error {
	fn from(e: AttemptError) -> Self {
		match e {
			AttemptError::Admission(e) => e.into(),
			AttemptError::CircuitOpen(e) => e.into(),
			AttemptError::Upstream(e) => e.into(),
		}
	}
}
