// self
use crate::_prelude::*;

const EPSILON: f64 = 1e-9;

/// Continuously refilling token bucket.
///
/// The bucket starts full and refills `refill_rate` tokens per second up to `capacity`. Refill is
/// computed lazily from the elapsed monotonic time whenever the bucket is observed.
#[derive(Clone, Debug)]
pub struct TokenBucket {
	capacity: u32,
	refill_rate: f64,
	tokens: f64,
	last_refill: Instant,
}
impl TokenBucket {
	/// Creates a full bucket.
	pub fn new(capacity: u32, refill_rate: f64) -> Self {
		Self::new_at(capacity, refill_rate, Instant::now())
	}

	pub(crate) fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
		Self { capacity, refill_rate, tokens: capacity as f64, last_refill: now }
	}

	/// Maximum number of tokens the bucket can hold.
	pub fn capacity(&self) -> u32 {
		self.capacity
	}

	/// Tokens added per second.
	pub fn refill_rate(&self) -> f64 {
		self.refill_rate
	}

	/// Consumes `n` tokens when available; never blocks.
	pub fn try_consume(&mut self, n: u32) -> bool {
		self.try_consume_at(n, Instant::now())
	}

	pub(crate) fn try_consume_at(&mut self, n: u32, now: Instant) -> bool {
		self.refill(now);

		let need = n as f64;

		if self.tokens + EPSILON >= need {
			self.tokens = (self.tokens - need).max(0.);

			true
		} else {
			false
		}
	}

	/// Time until `n` tokens will be available; zero when they already are.
	///
	/// Returns [`Duration::MAX`] when `n` exceeds the capacity or the bucket never refills.
	pub fn time_until_available(&mut self, n: u32) -> Duration {
		self.time_until_available_at(n, Instant::now())
	}

	pub(crate) fn time_until_available_at(&mut self, n: u32, now: Instant) -> Duration {
		if n > self.capacity {
			return Duration::MAX;
		}

		self.refill(now);

		let deficit = n as f64 - self.tokens;

		if deficit <= EPSILON {
			return Duration::ZERO;
		}
		if self.refill_rate <= 0. {
			return Duration::MAX;
		}

		Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX)
	}

	/// Tokens currently available after applying pending refill.
	pub fn available_tokens(&mut self) -> f64 {
		self.available_tokens_at(Instant::now())
	}

	pub(crate) fn available_tokens_at(&mut self, now: Instant) -> f64 {
		self.refill(now);

		self.tokens
	}

	/// Returns `n` previously consumed tokens, saturating at the capacity.
	pub fn refund(&mut self, n: u32) {
		self.tokens = (self.tokens + n as f64).min(self.capacity as f64);
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();

		if elapsed > 0. {
			self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
			self.last_refill = now;
		}
	}
}
