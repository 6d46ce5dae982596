use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Observer registry. Callbacks run synchronously, in registration order,
/// on the publishing task.
pub struct Subscribers<T> {
	next_id: AtomicU64,
	entries: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T> Default for Subscribers<T> {
	fn default() -> Self { Self { next_id: AtomicU64::new(1), entries: RwLock::new(Vec::new()) } }
}

impl<T> Subscribers<T> {
	pub fn new() -> Self { Self::default() }

	pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
		let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.entries.write().push((id, Arc::new(callback)));
		id
	}

	/// Returns false if `id` was not registered.
	pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
		let mut entries = self.entries.write();
		let before = entries.len();
		entries.retain(|(eid, _)| *eid != id);
		entries.len() != before
	}

	pub fn len(&self) -> usize { self.entries.read().len() }
	pub fn is_empty(&self) -> bool { self.entries.read().is_empty() }

	pub fn publish(&self, event: &T) {
		// Snapshot the list so callbacks may (un)subscribe without deadlocking.
		let callbacks: Vec<Callback<T>> = self.entries.read().iter().map(|(_, cb)| cb.clone()).collect();
		for cb in callbacks {
			cb(event);
		}
	}
}
