// self
use crate::_prelude::*;

/// Counts admissions inside a trailing time window.
///
/// Used both as the burst guard and as the strict cap behind each token-bucket tier, so that no
/// window of length `span` ever holds more than `limit` admissions.
#[derive(Clone, Debug)]
pub(crate) struct SlidingWindow {
	limit: u32,
	span: Duration,
	stamps: VecDeque<Instant>,
}
impl SlidingWindow {
	pub(crate) fn new(limit: u32, span: Duration) -> Self {
		Self { limit, span, stamps: VecDeque::with_capacity(limit as usize) }
	}

	/// Time until another admission fits; zero when one fits now.
	pub(crate) fn wait_time(&mut self, now: Instant) -> Duration {
		self.evict(now);

		if self.stamps.len() < self.limit as usize {
			return Duration::ZERO;
		}

		// Full window: the oldest stamp has to age out.
		match self.stamps.front() {
			Some(oldest) => (*oldest + self.span).saturating_duration_since(now),
			None => Duration::ZERO,
		}
	}

	pub(crate) fn record(&mut self, now: Instant) {
		self.evict(now);
		self.stamps.push_back(now);

		while self.stamps.len() > self.limit as usize {
			self.stamps.pop_front();
		}
	}

	pub(crate) fn forget_latest(&mut self) {
		self.stamps.pop_back();
	}

	pub(crate) fn len(&mut self, now: Instant) -> usize {
		self.evict(now);

		self.stamps.len()
	}

	fn evict(&mut self, now: Instant) {
		while let Some(front) = self.stamps.front() {
			if now.saturating_duration_since(*front) >= self.span {
				self.stamps.pop_front();
			} else {
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn blocks_until_oldest_stamp_ages_out() {
		let now = Instant::now();
		let mut window = SlidingWindow::new(2, Duration::from_millis(500));

		window.record(now);
		window.record(now + Duration::from_millis(100));

		assert_eq!(
			window.wait_time(now + Duration::from_millis(200)),
			Duration::from_millis(300)
		);
		assert_eq!(window.wait_time(now + Duration::from_millis(500)), Duration::ZERO);
		assert_eq!(window.len(now + Duration::from_millis(500)), 1);
	}

	#[test]
	fn forget_latest_releases_a_slot() {
		let now = Instant::now();
		let mut window = SlidingWindow::new(1, Duration::from_secs(1));

		window.record(now);

		assert!(window.wait_time(now) > Duration::ZERO);

		window.forget_latest();

		assert_eq!(window.wait_time(now), Duration::ZERO);
	}
}
