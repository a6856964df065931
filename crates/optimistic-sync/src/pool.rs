use crate::record::{OwnerId, SubscriptionId};

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 5;

/// Process-wide limit on open push subscriptions, shared by every [`crate::ChangeStreamManager`]
/// it is handed to. Every live subscription holds exactly one slot, so two sessions for the same
/// owner count twice.
#[derive(Debug)]
pub struct ConnectionPool {
	capacity: usize,
	slots: Mutex<HashMap<SubscriptionId, OwnerId>>,
}

impl Default for ConnectionPool {
	fn default() -> Self {
		Self::new(DEFAULT_CAPACITY)
	}
}

impl ConnectionPool {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity,
			slots: Mutex::new(HashMap::with_capacity(capacity)),
		}
	}

	#[must_use]
	pub const fn capacity(&self) -> usize {
		self.capacity
	}

	/// Take a slot for subscription `id`. Acquiring a slot `id` already holds always succeeds.
	pub async fn try_acquire(&self, owner: &OwnerId, id: SubscriptionId) -> bool {
		let mut slots = self.slots.lock().await;

		if slots.contains_key(&id) {
			return true;
		}

		if slots.len() >= self.capacity {
			trace!(%owner, active = slots.len(), "Connection pool at capacity");
			return false;
		}

		slots.insert(id, owner.clone());
		true
	}

	pub async fn release(&self, id: SubscriptionId) {
		if let Some(owner) = self.slots.lock().await.remove(&id) {
			trace!(%owner, subscription_id = %id, "Released pool slot");
		}
	}

	/// Whether any live subscription belongs to `owner`
	pub async fn holds(&self, owner: &OwnerId) -> bool {
		self.slots.lock().await.values().any(|holder| holder == owner)
	}

	pub async fn active_count(&self) -> usize {
		self.slots.lock().await.len()
	}
}
