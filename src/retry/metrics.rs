// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::_prelude::*;

/// Thread-safe counters for retried operations.
#[derive(Debug, Default)]
pub struct RetryMetrics {
	retries: AtomicU64,
	recovered: AtomicU64,
	exhausted: AtomicU64,
}
impl RetryMetrics {
	/// Returns the number of retries scheduled.
	pub fn retries(&self) -> u64 {
		self.retries.load(Ordering::Relaxed)
	}

	/// Returns the number of operations that succeeded after at least one retry.
	pub fn successful_retries(&self) -> u64 {
		self.recovered.load(Ordering::Relaxed)
	}

	/// Returns the number of operations that failed after at least one retry.
	pub fn failed_retries(&self) -> u64 {
		self.exhausted.load(Ordering::Relaxed)
	}

	/// Share of retried operations that eventually succeeded; `1.0` before any retry.
	pub fn success_rate(&self) -> f64 {
		let recovered = self.successful_retries();
		let total = recovered + self.failed_retries();

		if total == 0 { 1. } else { recovered as f64 / total as f64 }
	}

	/// Copies the counters into a serializable value.
	pub fn snapshot(&self) -> RetrySnapshot {
		RetrySnapshot {
			retries: self.retries(),
			successful_retries: self.successful_retries(),
			failed_retries: self.failed_retries(),
		}
	}

	pub(crate) fn record_retry(&self) {
		self.retries.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_recovered(&self) {
		self.recovered.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_exhausted(&self) {
		self.exhausted.fetch_add(1, Ordering::Relaxed);
	}
}

/// Serializable copy of [`RetryMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetrySnapshot {
	/// Retries scheduled.
	pub retries: u64,
	/// Operations that succeeded after retrying.
	pub successful_retries: u64,
	/// Operations that failed after retrying.
	pub failed_retries: u64,
}
