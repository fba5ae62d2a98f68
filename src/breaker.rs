//! Three-state circuit breaker that isolates a failing dependency.
//!
//! - **Closed**: calls pass; consecutive counted failures reaching the threshold open the circuit.
//! - **Open**: calls fail fast with [`CircuitOpenError`]. Once the recovery window elapses, the next
//!   call flips the breaker to half-open before running.
//! - **Half-open**: up to `half_open_max_calls` probes run concurrently; that many successes close
//!   the circuit, and any probe failure reopens it immediately.
//!
//! All transitions happen under one lock. Hooks run after the lock is released, and hook errors
//! are logged and dropped.

mod registry;

pub use registry::BreakerRegistry;

// std
use std::panic::{self, AssertUnwindSafe};
// self
use crate::{
	_prelude::*,
	error::{BoxError, CircuitOpenError},
	obs::{self, event},
};

/// Callback invoked after a state transition; errors and panics are logged and dropped.
pub type TransitionHook = Arc<dyn Fn(&Transition) -> Result<(), BoxError> + Send + Sync>;

/// Breaker states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
	/// Calls pass through.
	#[default]
	Closed,
	/// Calls are rejected.
	Open,
	/// A bounded number of probe calls pass through.
	HalfOpen,
}
impl CircuitState {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			CircuitState::Closed => "closed",
			CircuitState::Open => "open",
			CircuitState::HalfOpen => "half_open",
		}
	}
}
impl Display for CircuitState {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Breaker tunables; usually projected from
/// [`GovernorConfig::breaker_config`](crate::config::GovernorConfig::breaker_config).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
	/// Consecutive counted failures that open the circuit.
	pub failure_threshold: u32,
	/// Time the circuit stays open before probing.
	pub recovery_timeout: Duration,
	/// Probes admitted, and successes required to close, while half-open.
	pub half_open_max_calls: u32,
}
impl Default for BreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			recovery_timeout: Duration::from_secs(60),
			half_open_max_calls: 3,
		}
	}
}

/// Describes one state change, handed to hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
	/// Breaker name.
	pub breaker: String,
	/// Previous state.
	pub from: CircuitState,
	/// New state.
	pub to: CircuitState,
	/// Consecutive failures at the time of the change.
	pub consecutive_failures: u32,
	/// Wall-clock time of the change.
	pub at: OffsetDateTime,
}

/// Lifetime call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
	/// Calls attempted, rejected ones included.
	pub total_calls: u64,
	/// Calls whose outcome counted as success.
	pub successful_calls: u64,
	/// Calls whose outcome counted as failure.
	pub failed_calls: u64,
	/// Calls rejected without running.
	pub rejected_calls: u64,
	/// State transitions.
	pub state_changes: u64,
}
impl BreakerStats {
	/// Share of attempted calls that succeeded; `1.0` before any call.
	pub fn success_rate(&self) -> f64 {
		if self.total_calls == 0 {
			1.
		} else {
			self.successful_calls as f64 / self.total_calls as f64
		}
	}
}

/// Point-in-time view of a breaker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerSnapshot {
	/// Breaker name.
	pub name: String,
	/// Current state.
	pub state: CircuitState,
	/// Consecutive counted failures.
	pub consecutive_failures: u32,
	/// Probes currently running.
	pub probes_in_flight: u32,
	/// Probe successes in the current half-open period.
	pub probe_successes: u32,
	/// Wall-clock time of the latest failure.
	pub last_failure_at: Option<OffsetDateTime>,
	/// Time spent open so far.
	pub open_for: Option<Duration>,
	/// Time left before probes are admitted.
	pub retry_in: Option<Duration>,
	/// Lifetime counters.
	pub stats: BreakerStats,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, ThisError)]
pub enum BreakerError<E> {
	/// The call was rejected without running.
	#[error(transparent)]
	Open(CircuitOpenError),
	/// The call ran and failed.
	#[error(transparent)]
	Inner(E),
}

/// Thread-safe circuit breaker guarding one dependency.
pub struct CircuitBreaker {
	name: String,
	config: BreakerConfig,
	state: Mutex<BreakerState>,
	on_open: Vec<TransitionHook>,
	on_close: Vec<TransitionHook>,
	on_half_open: Vec<TransitionHook>,
}
impl CircuitBreaker {
	/// Creates a closed breaker.
	pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
		Self {
			name: name.into(),
			config,
			state: Mutex::new(BreakerState::default()),
			on_open: Vec::new(),
			on_close: Vec::new(),
			on_half_open: Vec::new(),
		}
	}

	/// Registers a hook fired after the circuit opens.
	pub fn with_on_open<F>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(&Transition) -> Result<(), BoxError>,
	{
		self.on_open.push(Arc::new(hook));

		self
	}

	/// Registers a hook fired after the circuit closes.
	pub fn with_on_close<F>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(&Transition) -> Result<(), BoxError>,
	{
		self.on_close.push(Arc::new(hook));

		self
	}

	/// Registers a hook fired after the circuit turns half-open.
	pub fn with_on_half_open<F>(mut self, hook: F) -> Self
	where
		F: 'static + Send + Sync + Fn(&Transition) -> Result<(), BoxError>,
	{
		self.on_half_open.push(Arc::new(hook));

		self
	}

	/// Breaker name.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Active configuration.
	pub fn config(&self) -> &BreakerConfig {
		&self.config
	}

	/// Stored state; an elapsed open circuit reports [`CircuitState::Open`] until the next call.
	pub fn state(&self) -> CircuitState {
		self.state.lock().state
	}

	/// Whether the circuit is closed.
	pub fn is_closed(&self) -> bool {
		self.state() == CircuitState::Closed
	}

	/// Whether the circuit is open.
	pub fn is_open(&self) -> bool {
		self.state() == CircuitState::Open
	}

	/// Whether the circuit is half-open.
	pub fn is_half_open(&self) -> bool {
		self.state() == CircuitState::HalfOpen
	}

	/// Runs `op` through the breaker, counting every error as a failure.
	pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
	{
		self.call_classified(op, |_| true).await
	}

	/// Runs `op` through the breaker; `counts` decides which errors count as failures.
	///
	/// Errors that do not count are treated as successful contact with the dependency.
	pub async fn call_classified<F, Fut, T, E, P>(
		&self,
		op: F,
		counts: P,
	) -> Result<T, BreakerError<E>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T, E>>,
		P: FnOnce(&E) -> bool,
	{
		let permit = self.admit().map_err(BreakerError::Open)?;
		let result = op().await;

		match &result {
			Err(e) if counts(e) => permit.fail(),
			_ => permit.succeed(),
		}

		result.map_err(BreakerError::Inner)
	}

	/// Forces the breaker closed and clears failure counters; lifetime stats are kept.
	pub fn reset(&self) {
		let transition = {
			let mut state = self.state.lock();
			let transition = (state.state != CircuitState::Closed)
				.then(|| self.transition(&mut state, CircuitState::Closed, Instant::now()));

			state.consecutive_failures = 0;
			state.last_failure_at = None;

			transition
		};

		event!(INFO, breaker = %self.name, "Circuit breaker reset.");

		if let Some(transition) = transition {
			self.fire(transition);
		}
	}

	/// Captures state and counters.
	pub fn snapshot(&self) -> BreakerSnapshot {
		let now = Instant::now();
		let state = self.state.lock();
		let open_for = state.opened_at.map(|at| now.saturating_duration_since(at));

		BreakerSnapshot {
			name: self.name.clone(),
			state: state.state,
			consecutive_failures: state.consecutive_failures,
			probes_in_flight: state.probes_in_flight,
			probe_successes: state.probe_successes,
			last_failure_at: state.last_failure_at,
			open_for,
			retry_in: open_for.map(|d| self.config.recovery_timeout.saturating_sub(d)),
			stats: state.stats,
		}
	}

	fn admit(&self) -> Result<Permit<'_>, CircuitOpenError> {
		let now = Instant::now();
		let mut transition = None;
		let admitted = {
			let mut state = self.state.lock();

			state.stats.total_calls += 1;

			if state.state == CircuitState::Open
				&& state.opened_at.is_some_and(|at| {
					now.saturating_duration_since(at) >= self.config.recovery_timeout
				}) {
				transition = Some(self.transition(&mut state, CircuitState::HalfOpen, now));
			}

			match state.state {
				CircuitState::Closed => Ok(Permit::new(self, state.epoch, false)),
				CircuitState::HalfOpen
					if state.probes_in_flight + state.probe_successes
						< self.config.half_open_max_calls =>
				{
					state.probes_in_flight += 1;

					Ok(Permit::new(self, state.epoch, true))
				},
				_ => {
					state.stats.rejected_calls += 1;

					Err(CircuitOpenError {
						breaker: self.name.clone(),
						state: state.state,
						consecutive_failures: state.consecutive_failures,
						last_failure_at: state.last_failure_at,
						recovery_timeout: self.config.recovery_timeout,
						retry_in: state.opened_at.map(|at| {
							self.config
								.recovery_timeout
								.saturating_sub(now.saturating_duration_since(at))
						}),
					})
				},
			}
		};

		if let Some(transition) = transition {
			self.fire(transition);
		}

		admitted
	}

	fn settle(&self, epoch: u64, probe: bool, success: bool) {
		let now = Instant::now();
		let transition = {
			let mut state = self.state.lock();

			if success {
				state.stats.successful_calls += 1;
			} else {
				state.stats.failed_calls += 1;
				state.last_failure_at = Some(OffsetDateTime::now_utc());
			}

			// Outcomes from before the latest transition only feed the stats.
			if epoch != state.epoch {
				return;
			}

			match (state.state, success) {
				(CircuitState::Closed, true) => {
					state.consecutive_failures = 0;

					None
				},
				(CircuitState::Closed, false) => {
					state.consecutive_failures += 1;

					(state.consecutive_failures >= self.config.failure_threshold)
						.then(|| self.transition(&mut state, CircuitState::Open, now))
				},
				(CircuitState::HalfOpen, true) if probe => {
					state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
					state.probe_successes += 1;

					(state.probe_successes >= self.config.half_open_max_calls)
						.then(|| self.transition(&mut state, CircuitState::Closed, now))
				},
				(CircuitState::HalfOpen, false) => {
					state.consecutive_failures += 1;

					Some(self.transition(&mut state, CircuitState::Open, now))
				},
				_ => None,
			}
		};

		if let Some(transition) = transition {
			self.fire(transition);
		}
	}

	fn abandon_probe(&self, epoch: u64) {
		let mut state = self.state.lock();

		if epoch == state.epoch && state.state == CircuitState::HalfOpen {
			state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
		}
	}

	fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) -> Transition {
		let from = state.state;

		state.state = to;
		state.epoch += 1;
		state.probes_in_flight = 0;
		state.probe_successes = 0;
		state.stats.state_changes += 1;

		match to {
			CircuitState::Open => state.opened_at = Some(now),
			CircuitState::HalfOpen => state.opened_at = None,
			CircuitState::Closed => {
				state.opened_at = None;
				state.consecutive_failures = 0;
			},
		}

		Transition {
			breaker: self.name.clone(),
			from,
			to,
			consecutive_failures: state.consecutive_failures,
			at: OffsetDateTime::now_utc(),
		}
	}

	fn fire(&self, transition: Transition) {
		match transition.to {
			CircuitState::Open => event!(
				WARN,
				breaker = %self.name,
				from = %transition.from,
				consecutive_failures = transition.consecutive_failures,
				"Circuit opened."
			),
			CircuitState::HalfOpen => event!(
				INFO,
				breaker = %self.name,
				"Circuit half-open; admitting probes."
			),
			CircuitState::Closed => event!(
				INFO,
				breaker = %self.name,
				from = %transition.from,
				"Circuit closed."
			),
		}

		obs::record_breaker_transition(&self.name, transition.to);

		let hooks = match transition.to {
			CircuitState::Open => &self.on_open,
			CircuitState::HalfOpen => &self.on_half_open,
			CircuitState::Closed => &self.on_close,
		};

		for hook in hooks {
			match panic::catch_unwind(AssertUnwindSafe(|| hook(&transition))) {
				Ok(Ok(())) => {},
				Ok(Err(e)) => event!(
					ERROR,
					breaker = %self.name,
					state = %transition.to,
					error = %e,
					"Transition hook failed."
				),
				Err(_) => event!(
					ERROR,
					breaker = %self.name,
					state = %transition.to,
					"Transition hook panicked."
				),
			}
		}
	}
}
impl Debug for CircuitBreaker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CircuitBreaker")
			.field("name", &self.name)
			.field("config", &self.config)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Default)]
struct BreakerState {
	state: CircuitState,
	consecutive_failures: u32,
	opened_at: Option<Instant>,
	probes_in_flight: u32,
	probe_successes: u32,
	// Bumped on every transition; tags permits so late outcomes can be recognised.
	epoch: u64,
	last_failure_at: Option<OffsetDateTime>,
	stats: BreakerStats,
}

/// Admission granted by [`CircuitBreaker::admit`]; dropping it unsettled releases a probe slot.
struct Permit<'a> {
	breaker: &'a CircuitBreaker,
	epoch: u64,
	probe: bool,
	settled: bool,
}
impl<'a> Permit<'a> {
	fn new(breaker: &'a CircuitBreaker, epoch: u64, probe: bool) -> Self {
		Self { breaker, epoch, probe, settled: false }
	}

	fn succeed(mut self) {
		self.settled = true;
		self.breaker.settle(self.epoch, self.probe, true);
	}

	fn fail(mut self) {
		self.settled = true;
		self.breaker.settle(self.epoch, self.probe, false);
	}
}
impl Drop for Permit<'_> {
	fn drop(&mut self) {
		if !self.settled && self.probe {
			self.breaker.abandon_probe(self.epoch);
		}
	}
}
