//! Dual-tier admission control with priority ordering, a burst guard, and adaptive throttling.
//!
//! A [`DualTierLimiter`] owns one background admission loop that is spawned on the first
//! [`acquire`](DualTierLimiter::acquire) and stopped by [`shutdown`](DualTierLimiter::shutdown).
//! Callers enqueue a ticket and suspend until the loop admits it. The loop always serves the
//! highest-priority live ticket, waits until the per-second tier, the per-minute tier, and the
//! burst guard all have room, then consumes from each of them under one lock.

mod bucket;
mod queue;
mod window;

pub use bucket::TokenBucket;
pub use queue::{Priority, PriorityDepth};

// crates.io
use tokio::{
	sync::{Notify, oneshot},
	task::JoinHandle,
};
// self
use crate::{
	_prelude::*,
	error::AdmissionError,
	limiter::{
		queue::{AdmissionQueue, Ticket},
		window::SlidingWindow,
	},
	obs::{self, event},
};

const THROTTLE_DECAY: f64 = 0.75;
const THROTTLE_RECOVERY: f64 = 1.1;
const RETRY_GRANULARITY: Duration = Duration::from_millis(1);

/// Limiter tunables; usually projected from
/// [`GovernorConfig::limiter_config`](crate::config::GovernorConfig::limiter_config).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
	/// Short-horizon tier capacity; also its refill rate per second.
	pub per_second_limit: u32,
	/// Long-horizon tier capacity, refilled over one minute.
	pub per_minute_limit: u32,
	/// Admissions allowed inside one burst window.
	pub burst_size: u32,
	/// Trailing burst window.
	pub burst_window: Duration,
	/// Lowest reachable throttle factor.
	pub throttle_floor: f64,
	/// Whether rejections change the throttle factor.
	pub adaptive_throttling: bool,
	/// Wake-up interval of an idle admission loop.
	pub idle_poll_interval: Duration,
}
impl Default for LimiterConfig {
	fn default() -> Self {
		Self {
			per_second_limit: 6,
			per_minute_limit: 360,
			burst_size: 3,
			burst_window: Duration::from_millis(500),
			throttle_floor: 0.25,
			adaptive_throttling: true,
			idle_poll_interval: Duration::from_secs(1),
		}
	}
}

/// Point-in-time view of a limiter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LimiterSnapshot {
	/// Tickets admitted since creation.
	pub admitted: u64,
	/// Times the admission loop had to wait for capacity.
	pub throttled_waits: u64,
	/// Upstream rejections reported since creation.
	pub upstream_rejections: u64,
	/// Rejections reported since the last success.
	pub consecutive_rejections: u32,
	/// Current adaptive throttle factor in `(0, 1]`.
	pub throttle_factor: f64,
	/// Tokens left in the per-second tier.
	pub per_second_available: f64,
	/// Tokens left in the per-minute tier.
	pub per_minute_available: f64,
	/// Admissions inside the current burst window.
	pub burst_in_window: usize,
	/// Live queued tickets.
	pub queued: usize,
	/// Live queued tickets per priority.
	pub queue_depth: PriorityDepth,
	/// Whether admissions are held.
	pub paused: bool,
	/// Whether the limiter still accepts tickets.
	pub accepting: bool,
}

/// Shared dual-tier limiter handle; clones refer to the same limiter.
#[derive(Clone)]
pub struct DualTierLimiter {
	shared: Arc<LimiterShared>,
}
impl DualTierLimiter {
	/// Creates a limiter; the admission loop starts on the first acquisition.
	pub fn new(name: impl Into<String>, config: LimiterConfig) -> Self {
		let now = Instant::now();
		let state = LimiterState {
			second: Tier::new(config.per_second_limit, Duration::from_secs(1), now),
			minute: Tier::new(config.per_minute_limit, Duration::from_secs(60), now),
			burst: SlidingWindow::new(config.burst_size, config.burst_window),
			throttle: Throttle { factor: 1., consecutive_rejections: 0, total_rejections: 0 },
			admitted: 0,
			throttled_waits: 0,
			waiting: false,
			queue: AdmissionQueue::default(),
			next_seq: 0,
			accepting: true,
			paused: false,
		};

		Self {
			shared: Arc::new(LimiterShared {
				name: name.into(),
				config,
				state: Mutex::new(state),
				notify: Arc::new(Notify::new()),
				worker: AsyncMutex::new(None),
			}),
		}
	}

	/// Name used in logs and metrics.
	pub fn name(&self) -> &str {
		&self.shared.name
	}

	/// Active configuration.
	pub fn config(&self) -> &LimiterConfig {
		&self.shared.config
	}

	/// Suspends until a slot is granted.
	///
	/// Dropping the returned future abandons the ticket; the admission loop skips it without
	/// consuming capacity.
	pub async fn acquire(&self, priority: Priority) -> Result<(), AdmissionError> {
		let rx = self.enqueue(priority)?;

		self.ensure_worker().await;
		self.shared.notify.notify_one();

		// A dropped sender means the limiter went away with the ticket still queued.
		rx.await.unwrap_or(Err(AdmissionError::Shutdown))
	}

	/// Like [`acquire`](Self::acquire), but gives up after `timeout`.
	pub async fn acquire_timeout(
		&self,
		priority: Priority,
		timeout: Duration,
	) -> Result<(), AdmissionError> {
		tokio::time::timeout(timeout, self.acquire(priority))
			.await
			.unwrap_or(Err(AdmissionError::TimedOut { waited: timeout }))
	}

	/// Acquires with an optional deadline and an optional cancellation token.
	pub async fn acquire_with(
		&self,
		priority: Priority,
		timeout: Option<Duration>,
		cancel: Option<&CancellationToken>,
	) -> Result<(), AdmissionError> {
		let admission = async {
			match timeout {
				Some(timeout) => self.acquire_timeout(priority, timeout).await,
				None => self.acquire(priority).await,
			}
		};

		match cancel {
			Some(token) => tokio::select! {
				biased;
				_ = token.cancelled() => Err(AdmissionError::Cancelled),
				result = admission => result,
			},
			None => admission.await,
		}
	}

	/// Records an upstream throttling signal (HTTP 429).
	pub fn report_rejection(&self) {
		let (factor, consecutive) = {
			let mut state = self.shared.state.lock();
			let throttle = &mut state.throttle;

			throttle.total_rejections += 1;
			throttle.consecutive_rejections += 1;

			if self.shared.config.adaptive_throttling {
				throttle.factor =
					(throttle.factor * THROTTLE_DECAY).max(self.shared.config.throttle_floor);
			}

			(throttle.factor, throttle.consecutive_rejections)
		};

		event!(
			WARN,
			limiter = %self.shared.name,
			throttle_factor = factor,
			consecutive_rejections = consecutive,
			"Upstream rejected a request; throttling admissions."
		);
		obs::record_throttle_factor(&self.shared.name, factor);
	}

	/// Records a successful upstream call; nudges the throttle back up after rejections.
	pub fn report_success(&self) {
		let recovered = {
			let mut state = self.shared.state.lock();
			let throttle = &mut state.throttle;

			if throttle.consecutive_rejections == 0 {
				None
			} else {
				throttle.consecutive_rejections = 0;

				if self.shared.config.adaptive_throttling {
					throttle.factor = (throttle.factor * THROTTLE_RECOVERY).min(1.);
				}

				Some(throttle.factor)
			}
		};

		if let Some(factor) = recovered {
			event!(
				INFO,
				limiter = %self.shared.name,
				throttle_factor = factor,
				"Upstream accepted a request; easing throttle."
			);
			obs::record_throttle_factor(&self.shared.name, factor);
		}
	}

	/// Current adaptive throttle factor.
	pub fn throttle_factor(&self) -> f64 {
		self.shared.state.lock().throttle.factor
	}

	/// Holds admissions; queued and new tickets wait until [`resume`](Self::resume).
	pub fn pause(&self) {
		self.shared.state.lock().paused = true;
	}

	/// Releases a [`pause`](Self::pause).
	pub fn resume(&self) {
		self.shared.state.lock().paused = false;
		self.shared.notify.notify_one();
	}

	/// Captures counters, tier levels, and queue depth.
	pub fn snapshot(&self) -> LimiterSnapshot {
		let now = Instant::now();
		let mut state = self.shared.state.lock();
		let queue_depth = state.queue.depth_by_priority();

		LimiterSnapshot {
			admitted: state.admitted,
			throttled_waits: state.throttled_waits,
			upstream_rejections: state.throttle.total_rejections,
			consecutive_rejections: state.throttle.consecutive_rejections,
			throttle_factor: state.throttle.factor,
			per_second_available: state.second.bucket.available_tokens_at(now),
			per_minute_available: state.minute.bucket.available_tokens_at(now),
			burst_in_window: state.burst.len(now),
			queued: queue_depth.high + queue_depth.normal + queue_depth.low,
			queue_depth,
			paused: state.paused,
			accepting: state.accepting,
		}
	}

	/// Stops accepting tickets, resolves queued ones with [`AdmissionError::Shutdown`], and joins
	/// the admission loop.
	pub async fn shutdown(&self) {
		let drained = {
			let mut state = self.shared.state.lock();

			state.accepting = false;
			state.queue.drain().collect::<Vec<_>>()
		};
		let drained_count = drained.len();

		for ticket in drained {
			let _ = ticket.tx.send(Err(AdmissionError::Shutdown));
		}

		self.shared.notify.notify_one();

		let worker = self.shared.worker.lock().await.take();

		if let Some(worker) = worker
			&& let Err(e) = worker.await
		{
			event!(ERROR, limiter = %self.shared.name, error = %e, "Admission loop panicked.");
		}

		event!(
			INFO,
			limiter = %self.shared.name,
			drained = drained_count,
			"Limiter shut down."
		);
	}

	fn enqueue(
		&self,
		priority: Priority,
	) -> Result<oneshot::Receiver<Result<(), AdmissionError>>, AdmissionError> {
		let (tx, rx) = oneshot::channel();
		let mut state = self.shared.state.lock();

		if !state.accepting {
			return Err(AdmissionError::Shutdown);
		}

		let seq = state.next_seq;

		state.next_seq += 1;
		state.queue.push(Ticket { priority, seq, enqueued_at: Instant::now(), tx });

		Ok(rx)
	}

	async fn ensure_worker(&self) {
		let mut worker = self.shared.worker.lock().await;

		if worker.is_some() || !self.shared.state.lock().accepting {
			return;
		}

		event!(DEBUG, limiter = %self.shared.name, "Starting admission loop.");

		*worker = Some(tokio::spawn(admission_loop(Arc::downgrade(&self.shared))));
	}
}
impl Debug for DualTierLimiter {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("DualTierLimiter")
			.field("name", &self.shared.name)
			.field("config", &self.shared.config)
			.finish_non_exhaustive()
	}
}

struct LimiterShared {
	name: String,
	config: LimiterConfig,
	state: Mutex<LimiterState>,
	notify: Arc<Notify>,
	worker: AsyncMutex<Option<JoinHandle<()>>>,
}
impl LimiterShared {
	fn step(&self, now: Instant) -> Step {
		let mut state = self.state.lock();

		if !state.accepting && state.queue.is_empty() {
			return Step::Stop;
		}
		if state.paused || state.queue.peek_live().is_none() {
			state.waiting = false;

			return Step::Park(self.config.idle_poll_interval);
		}

		let wait = state.wait_time(now);

		if !wait.is_zero() {
			// Early wake-ups re-enter here; only the first park of a wait is counted.
			if !state.waiting {
				state.waiting = true;
				state.throttled_waits += 1;

				event!(
					DEBUG,
					limiter = %self.name,
					wait_ms = wait.as_millis() as u64,
					queued = state.queue.len(),
					"Waiting for capacity."
				);
			}

			return Step::Park(wait);
		}
		if !state.second.try_admit(now) {
			return Step::Park(RETRY_GRANULARITY);
		}
		if !state.minute.try_admit(now) {
			state.second.release();

			return Step::Park(RETRY_GRANULARITY);
		}

		state.burst.record(now);
		state.waiting = false;

		let Some(ticket) = state.queue.pop() else {
			state.release_admission();

			return Step::Admitted;
		};
		let queued_for = now.saturating_duration_since(ticket.enqueued_at);

		if ticket.tx.send(Ok(())).is_ok() {
			state.admitted += 1;

			event!(
				TRACE,
				limiter = %self.name,
				priority = %ticket.priority,
				queued_ms = queued_for.as_millis() as u64,
				"Admitted ticket."
			);
		} else {
			// The waiter left between the liveness check and the send.
			state.release_admission();
		}

		Step::Admitted
	}
}
impl Drop for LimiterShared {
	fn drop(&mut self) {
		self.notify.notify_one();
	}
}

struct LimiterState {
	second: Tier,
	minute: Tier,
	burst: SlidingWindow,
	throttle: Throttle,
	admitted: u64,
	throttled_waits: u64,
	// Set while the loop is parked for capacity; cleared on admission or idling.
	waiting: bool,
	queue: AdmissionQueue,
	next_seq: u64,
	accepting: bool,
	paused: bool,
}
impl LimiterState {
	fn wait_time(&mut self, now: Instant) -> Duration {
		let tier_wait = self.second.wait_time(now).max(self.minute.wait_time(now));
		let tier_wait = if tier_wait.is_zero() || self.throttle.factor >= 1. {
			tier_wait
		} else {
			Duration::try_from_secs_f64(tier_wait.as_secs_f64() / self.throttle.factor)
				.unwrap_or(Duration::MAX)
		};

		tier_wait.max(self.burst.wait_time(now))
	}

	fn release_admission(&mut self) {
		self.second.release();
		self.minute.release();
		self.burst.forget_latest();
	}
}

#[derive(Debug)]
struct Throttle {
	factor: f64,
	consecutive_rejections: u32,
	total_rejections: u64,
}

/// One rate horizon: a refilling bucket backed by a strict sliding log of the same size.
#[derive(Debug)]
struct Tier {
	bucket: TokenBucket,
	window: SlidingWindow,
}
impl Tier {
	fn new(limit: u32, horizon: Duration, now: Instant) -> Self {
		Self {
			bucket: TokenBucket::new_at(limit, limit as f64 / horizon.as_secs_f64(), now),
			window: SlidingWindow::new(limit, horizon),
		}
	}

	fn wait_time(&mut self, now: Instant) -> Duration {
		self.bucket.time_until_available_at(1, now).max(self.window.wait_time(now))
	}

	fn try_admit(&mut self, now: Instant) -> bool {
		if !self.window.wait_time(now).is_zero() || !self.bucket.try_consume_at(1, now) {
			return false;
		}

		self.window.record(now);

		true
	}

	fn release(&mut self) {
		self.bucket.refund(1);
		self.window.forget_latest();
	}
}

enum Step {
	Admitted,
	Park(Duration),
	Stop,
}

async fn admission_loop(shared: Weak<LimiterShared>) {
	loop {
		// Only a weak handle survives across parks so dropping every limiter handle ends the loop.
		let (notify, step) = {
			let Some(shared) = shared.upgrade() else {
				return;
			};
			let step = shared.step(Instant::now());

			(Arc::clone(&shared.notify), step)
		};

		match step {
			Step::Admitted => tokio::task::yield_now().await,
			Step::Park(wait) => {
				tokio::select! {
					_ = notify.notified() => {},
					_ = tokio::time::sleep(wait) => {},
				}
			},
			Step::Stop => return,
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	fn limiter(per_second_limit: u32) -> DualTierLimiter {
		DualTierLimiter::new(
			"test",
			LimiterConfig { per_second_limit, per_minute_limit: 100, ..Default::default() },
		)
	}

	#[test]
	fn throttle_recovery_is_geometric_and_isolated() {
		let limiter = limiter(2);

		for _ in 0..3 {
			limiter.report_rejection();
		}

		assert!((limiter.throttle_factor() - 0.421_875).abs() < 1e-9);

		for _ in 0..3 {
			limiter.report_success();
		}

		let factor = limiter.throttle_factor();

		assert!(factor < 1.);
		assert!((factor - 0.421_875 * 1.1).abs() < 1e-9);
		assert_eq!(limiter.snapshot().upstream_rejections, 3);
		assert_eq!(limiter.snapshot().consecutive_rejections, 0);
	}

	#[test]
	fn throttle_never_drops_below_floor() {
		let limiter = limiter(2);

		for _ in 0..50 {
			limiter.report_rejection();
		}

		assert_eq!(limiter.throttle_factor(), 0.25);
	}

	#[test]
	fn disabled_adaptation_still_counts_rejections() {
		let limiter = DualTierLimiter::new(
			"static",
			LimiterConfig { adaptive_throttling: false, ..Default::default() },
		);

		limiter.report_rejection();
		limiter.report_rejection();

		let snapshot = limiter.snapshot();

		assert_eq!(snapshot.throttle_factor, 1.);
		assert_eq!(snapshot.upstream_rejections, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn timed_out_waiters_do_not_consume_capacity() {
		let limiter = limiter(1);

		limiter.acquire(Priority::Normal).await.expect("First ticket should be admitted.");

		let err = limiter
			.acquire_timeout(Priority::High, Duration::from_millis(100))
			.await
			.expect_err("Second ticket should time out.");

		assert_eq!(err, AdmissionError::TimedOut { waited: Duration::from_millis(100) });
		assert_eq!(limiter.snapshot().admitted, 1);

		tokio::time::sleep(Duration::from_secs(1)).await;

		let before = Instant::now();

		limiter.acquire(Priority::Low).await.expect("Capacity should have refilled.");

		assert!(Instant::now().saturating_duration_since(before) < Duration::from_millis(10));
		assert_eq!(limiter.snapshot().admitted, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_token_abandons_the_wait() {
		let limiter = limiter(1);
		let token = CancellationToken::new();

		limiter.acquire(Priority::Normal).await.expect("First ticket should be admitted.");

		let cancel = token.clone();

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			cancel.cancel();
		});

		let err = limiter
			.acquire_with(Priority::Normal, None, Some(&token))
			.await
			.expect_err("Cancelled ticket should not be admitted.");

		assert_eq!(err, AdmissionError::Cancelled);
		assert_eq!(limiter.snapshot().admitted, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn burst_guard_spaces_out_admissions() {
		let limiter = DualTierLimiter::new(
			"burst",
			LimiterConfig {
				per_second_limit: 10,
				per_minute_limit: 100,
				burst_size: 2,
				burst_window: Duration::from_millis(500),
				..Default::default()
			},
		);
		let start = Instant::now();

		for _ in 0..3 {
			limiter.acquire(Priority::Normal).await.expect("Ticket should be admitted.");
		}

		assert!(Instant::now().saturating_duration_since(start) >= Duration::from_millis(500));
		assert_eq!(limiter.snapshot().throttled_waits, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn timed_out_tickets_behind_busy_traffic_are_released() {
		let limiter = limiter(1);

		limiter.pause();

		let handles = (0..50)
			.map(|_| {
				let limiter = limiter.clone();

				tokio::spawn(async move { limiter.acquire(Priority::High).await })
			})
			.collect::<Vec<_>>();

		while limiter.snapshot().queued < 50 {
			tokio::task::yield_now().await;
		}

		for _ in 0..200 {
			let err = limiter
				.acquire_timeout(Priority::Low, Duration::from_millis(1))
				.await
				.expect_err("Paused limiter should not admit.");

			assert!(matches!(err, AdmissionError::TimedOut { .. }));
		}

		let held = limiter.shared.state.lock().queue.len();

		assert!(held <= 101, "queue still holds {held} tickets for 50 live waiters");
		assert_eq!(limiter.snapshot().queued, 50);

		limiter.shutdown().await;

		for handle in handles {
			assert_eq!(
				handle.await.expect("Acquire task should not panic."),
				Err(AdmissionError::Shutdown)
			);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_rejects_new_tickets() {
		let limiter = limiter(2);

		limiter.acquire(Priority::Normal).await.expect("Ticket should be admitted.");
		limiter.shutdown().await;

		assert_eq!(limiter.acquire(Priority::High).await, Err(AdmissionError::Shutdown));
		assert!(!limiter.snapshot().accepting);
	}
}
