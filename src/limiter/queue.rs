// std
use std::cmp::Ordering;
// crates.io
use tokio::sync::oneshot::Sender;
// self
use crate::{_prelude::*, error::AdmissionError};

/// Admission priority; higher classes are always admitted first.
#[derive(
	Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	/// Background work.
	Low,
	/// Default class.
	#[default]
	Normal,
	/// Latency-sensitive work.
	High,
}
impl Priority {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Priority::Low => "low",
			Priority::Normal => "normal",
			Priority::High => "high",
		}
	}
}
impl Display for Priority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

// Smallest heap size at which abandoned tickets are swept on push.
const PRUNE_FLOOR: usize = 32;

pub(crate) type AdmissionSender = Sender<Result<(), AdmissionError>>;

/// Pending admission request.
#[derive(Debug)]
pub(crate) struct Ticket {
	pub(crate) priority: Priority,
	pub(crate) seq: u64,
	pub(crate) enqueued_at: Instant,
	pub(crate) tx: AdmissionSender,
}
impl PartialEq for Ticket {
	fn eq(&self, other: &Self) -> bool {
		self.priority == other.priority && self.seq == other.seq
	}
}
impl Eq for Ticket {}
impl PartialOrd for Ticket {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for Ticket {
	// Max-heap: higher priority first, then the earlier arrival.
	fn cmp(&self, other: &Self) -> Ordering {
		self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
	}
}

/// Priority queue with FIFO order inside each class.
///
/// Abandoned tickets are dropped when they reach the head, and swept from the whole heap whenever
/// it doubles past the live count seen at the previous sweep, so the heap stays within twice the
/// number of live waiters.
#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
	heap: BinaryHeap<Ticket>,
	prune_at: usize,
}
impl AdmissionQueue {
	pub(crate) fn push(&mut self, ticket: Ticket) {
		if self.heap.len() >= self.prune_at {
			self.heap.retain(|t| !t.tx.is_closed());
			self.prune_at = (self.heap.len() * 2).max(PRUNE_FLOOR);
		}

		self.heap.push(ticket);
	}

	/// Drops tickets whose waiter went away, then returns the head.
	pub(crate) fn peek_live(&mut self) -> Option<&Ticket> {
		while self.heap.peek().is_some_and(|t| t.tx.is_closed()) {
			self.heap.pop();
		}

		self.heap.peek()
	}

	pub(crate) fn pop(&mut self) -> Option<Ticket> {
		self.heap.pop()
	}

	pub(crate) fn len(&self) -> usize {
		self.heap.len()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.heap.is_empty()
	}

	pub(crate) fn depth_by_priority(&self) -> PriorityDepth {
		let mut depth = PriorityDepth::default();

		for ticket in self.heap.iter().filter(|t| !t.tx.is_closed()) {
			match ticket.priority {
				Priority::High => depth.high += 1,
				Priority::Normal => depth.normal += 1,
				Priority::Low => depth.low += 1,
			}
		}

		depth
	}

	pub(crate) fn drain(&mut self) -> impl Iterator<Item = Ticket> + '_ {
		self.heap.drain()
	}
}

/// Live queue depth per priority class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PriorityDepth {
	/// Waiting [`Priority::High`] tickets.
	pub high: usize,
	/// Waiting [`Priority::Normal`] tickets.
	pub normal: usize,
	/// Waiting [`Priority::Low`] tickets.
	pub low: usize,
}

#[cfg(test)]
mod tests {
	// crates.io
	use tokio::sync::oneshot;
	// self
	use super::*;

	fn ticket(priority: Priority, seq: u64) -> (Ticket, oneshot::Receiver<Result<(), AdmissionError>>) {
		let (tx, rx) = oneshot::channel();

		(Ticket { priority, seq, enqueued_at: Instant::now(), tx }, rx)
	}

	#[test]
	fn orders_by_priority_then_arrival() {
		let mut queue = AdmissionQueue::default();
		let mut receivers = Vec::new();

		for (priority, seq) in [
			(Priority::Low, 0),
			(Priority::Normal, 1),
			(Priority::High, 2),
			(Priority::Normal, 3),
			(Priority::High, 4),
		] {
			let (t, rx) = ticket(priority, seq);

			queue.push(t);
			receivers.push(rx);
		}

		let order = std::iter::from_fn(|| queue.pop()).map(|t| t.seq).collect::<Vec<_>>();

		assert_eq!(order, vec![2, 4, 1, 3, 0]);
	}

	#[test]
	fn abandoned_tickets_are_pruned_from_the_head() {
		let mut queue = AdmissionQueue::default();
		let (first, first_rx) = ticket(Priority::High, 0);
		let (second, _second_rx) = ticket(Priority::Normal, 1);

		queue.push(first);
		queue.push(second);
		drop(first_rx);

		assert_eq!(queue.depth_by_priority(), PriorityDepth { high: 0, normal: 1, low: 0 });
		assert_eq!(queue.peek_live().map(|t| t.seq), Some(1));
		assert_eq!(queue.len(), 1);
	}

	#[test]
	fn abandoned_tickets_behind_live_ones_are_swept_on_push() {
		let mut queue = AdmissionQueue::default();
		let mut live = Vec::new();

		for seq in 0..50 {
			let (t, rx) = ticket(Priority::High, seq);

			queue.push(t);
			live.push(rx);
		}
		for seq in 50..250 {
			let (t, rx) = ticket(Priority::Low, seq);

			queue.push(t);
			drop(rx);

			assert!(queue.len() <= 2 * live.len() + 1, "heap grew to {}", queue.len());
		}

		assert_eq!(queue.depth_by_priority(), PriorityDepth { high: 50, normal: 0, low: 0 });
		assert_eq!(queue.peek_live().map(|t| t.priority), Some(Priority::High));
	}
}
