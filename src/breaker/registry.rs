// self
use crate::{
	_prelude::*,
	breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker},
};

/// Named breakers shared across governors.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
	breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}
impl BreakerRegistry {
	/// Returns the breaker registered under `name`, creating it with `config` when missing.
	///
	/// `config` is ignored when the breaker already exists.
	pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
		if let Some(breaker) = self.breakers.read().get(name) {
			return Arc::clone(breaker);
		}

		let mut breakers = self.breakers.write();

		Arc::clone(
			breakers
				.entry(name.to_owned())
				.or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
		)
	}

	/// Registers a pre-built breaker (for example one with hooks), replacing any previous entry.
	pub fn insert(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
		let breaker = Arc::new(breaker);

		self.breakers.write().insert(breaker.name().to_owned(), Arc::clone(&breaker));

		breaker
	}

	/// Looks up a breaker by name.
	pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
		self.breakers.read().get(name).cloned()
	}

	/// Resets every registered breaker.
	pub fn reset_all(&self) {
		let breakers = self.breakers.read().values().cloned().collect::<Vec<_>>();

		for breaker in breakers {
			breaker.reset();
		}
	}

	/// Snapshots every registered breaker, sorted by name.
	pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
		let mut snapshots =
			self.breakers.read().values().map(|breaker| breaker.snapshot()).collect::<Vec<_>>();

		snapshots.sort_by(|a, b| a.name.cmp(&b.name));

		snapshots
	}
}
