//! Per-record temporary mute for push stream events
//!
//! The mutation gateway mutes a record right before writing it, so the echo of our own write
//! coming back through the push stream is not mistaken for an external change. Entries are only
//! ever removed by their expiry timer.

use crate::{record::RecordId, timer::Timer};

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
struct SuppressionEntry {
	expires_at: Instant,
	generation: u64,
	_expiry: Timer,
}

#[derive(Debug, Default)]
struct Entries {
	by_id: HashMap<RecordId, SuppressionEntry>,
	next_generation: u64,
}

#[derive(Debug, Clone)]
pub struct SuppressionRegistry {
	entries: Arc<Mutex<Entries>>,
	cancel: CancellationToken,
}

impl SuppressionRegistry {
	#[must_use]
	pub fn new(cancel: CancellationToken) -> Self {
		Self {
			entries: Arc::default(),
			cancel,
		}
	}

	/// Mute `id` for `duration`. Refreshing an existing entry can extend it but never shorten it.
	pub async fn suppress(&self, id: &RecordId, duration: Duration) {
		let expires_at = Instant::now() + duration;
		let mut entries = self.entries.lock().await;

		if entries
			.by_id
			.get(id)
			.is_some_and(|entry| entry.expires_at >= expires_at)
		{
			return;
		}

		let generation = entries.next_generation;
		entries.next_generation += 1;

		let expiry = Timer::schedule(duration, &self.cancel, {
			let entries = Arc::clone(&self.entries);
			let id = id.clone();

			async move {
				let mut entries = entries.lock().await;
				if entries
					.by_id
					.get(&id)
					.is_some_and(|entry| entry.generation == generation)
				{
					entries.by_id.remove(&id);
					trace!(record_id = %id, "Suppression expired");
				}
			}
		});

		trace!(record_id = %id, duration_ms = duration.as_millis(), "Suppressing stream events");

		entries.by_id.insert(
			id.clone(),
			SuppressionEntry {
				expires_at,
				generation,
				_expiry: expiry,
			},
		);
	}

	pub async fn is_suppressed(&self, id: &RecordId) -> bool {
		self.entries
			.lock()
			.await
			.by_id
			.get(id)
			.is_some_and(|entry| Instant::now() < entry.expires_at)
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.by_id.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.by_id.is_empty()
	}

	/// Drop every entry along with its timer, only for teardown
	pub async fn clear(&self) {
		self.entries.lock().await.by_id.clear();
	}
}
