//! Debounced batched persistence for a single edited record
//!
//! Field edits accumulate in a buffer, last value wins per field. Once the record has been idle
//! for a while the buffer is written through a [`RecordUpdater`] in one call. At most one save is
//! in flight, edits arriving meanwhile wait for the next cycle.

use crate::{
	config::PersisterConfig,
	error::Error,
	record::{Record, RecordId, RecordPatch},
	timer::Timer,
};

use std::{mem, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// What the persister needs from its owner
#[async_trait]
pub trait RecordUpdater: Send + Sync + 'static {
	/// Latest value of the record, `None` once it is no longer available
	async fn current(&self, id: &RecordId) -> Option<Record>;

	async fn update(&self, record: Record) -> Result<Record, Error>;

	async fn suppress(&self, id: &RecordId, duration: Duration);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaveState {
	#[default]
	Idle,
	Saving,
	Saved {
		at: DateTime<Utc>,
	},
	Error {
		message: String,
	},
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveStatus {
	pub state: SaveState,
	pub last_saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
	buffer: RecordPatch,
	saving: bool,
	debounce: Option<Timer>,
	revert: Option<Timer>,
	/// Bumped on every status transition, a revert timer only applies to its own transition
	generation: u64,
}

struct Inner {
	id: RecordId,
	updater: Arc<dyn RecordUpdater>,
	config: PersisterConfig,
	echo_window: Duration,
	state: Mutex<State>,
	status: watch::Sender<SaveStatus>,
	cancel: CancellationToken,
}

#[derive(Clone)]
pub struct BatchedPersister {
	inner: Arc<Inner>,
}

impl BatchedPersister {
	#[must_use]
	pub fn new(
		id: RecordId,
		updater: Arc<dyn RecordUpdater>,
		config: PersisterConfig,
		echo_window: Duration,
		cancel: &CancellationToken,
	) -> Self {
		let (status, _) = watch::channel(SaveStatus::default());

		Self {
			inner: Arc::new(Inner {
				id,
				updater,
				config,
				echo_window,
				state: Mutex::default(),
				status,
				cancel: cancel.child_token(),
			}),
		}
	}

	#[must_use]
	pub fn record_id(&self) -> &RecordId {
		&self.inner.id
	}

	/// Buffer a field-level edit and restart the idle window
	pub async fn batched_save(&self, patch: RecordPatch) {
		if self.inner.cancel.is_cancelled() {
			trace!(record_id = %self.inner.id, "Persister closed, dropping edit");
			return;
		}

		let mut state = self.inner.state.lock().await;
		state.buffer.merge(patch);

		if state.saving {
			trace!(record_id = %self.inner.id, "Save in flight, edit waits for the next cycle");
			return;
		}

		state.debounce = Some(Arc::clone(&self.inner).schedule_flush());
	}

	/// Write whatever is buffered right away, skipping the idle window
	pub async fn flush_now(&self) {
		self.inner.state.lock().await.debounce.take();
		Arc::clone(&self.inner).flush().await;
	}

	#[must_use]
	pub fn status(&self) -> SaveStatus {
		self.inner.status.borrow().clone()
	}

	#[must_use]
	pub fn watch_status(&self) -> watch::Receiver<SaveStatus> {
		self.inner.status.subscribe()
	}

	/// Whether some edit has not reached the remote store yet
	pub async fn has_pending(&self) -> bool {
		let state = self.inner.state.lock().await;
		state.saving || !state.buffer.is_empty()
	}

	/// Drop buffered edits and every timer, later edits are ignored
	pub async fn close(&self) {
		self.inner.cancel.cancel();

		let mut state = self.inner.state.lock().await;
		state.debounce = None;
		state.revert = None;
		state.buffer = RecordPatch::default();
	}
}

impl Inner {
	fn schedule_flush(self: Arc<Self>) -> Timer {
		let delay = self.config.idle();
		let cancel = self.cancel.clone();

		Timer::schedule(delay, &cancel, self.flush())
	}

	/// Boxed so a completed save can schedule the next one
	fn flush(self: Arc<Self>) -> BoxFuture<'static, ()> {
		async move {
			let patch = {
				let mut state = self.state.lock().await;

				if state.saving || state.buffer.is_empty() || self.cancel.is_cancelled() {
					return;
				}

				state.saving = true;
				state.debounce = None;
				state.revert = None;
				state.generation += 1;
				mem::take(&mut state.buffer)
			};

			let Some(current) = self.updater.current(&self.id).await else {
				debug!(record_id = %self.id, "Record is no longer available, skipping save");

				self.state.lock().await.saving = false;
				self.status.send_modify(|status| status.state = SaveState::Idle);

				return;
			};

			self.status.send_modify(|status| status.state = SaveState::Saving);

			self.updater.suppress(&self.id, self.echo_window).await;

			let res = self.updater.update(patch.apply_to(current)).await;

			let mut state = self.state.lock().await;
			state.saving = false;

			if self.cancel.is_cancelled() {
				debug!(record_id = %self.id, "Persister closed during save, dropping the response");
				return;
			}

			state.generation += 1;

			let (reflush, revert_after) = match res {
				Ok(_) => {
					let at = Utc::now();
					trace!(record_id = %self.id, "Saved batched changes");

					self.status.send_replace(SaveStatus {
						state: SaveState::Saved { at },
						last_saved_at: Some(at),
					});

					(!state.buffer.is_empty(), self.config.saved_display())
				}

				Err(e) => {
					error!(record_id = %self.id, ?e, "Failed to save batched changes");

					// keep the failed edits for a retry, newer edits for the same fields win
					let newer = mem::replace(&mut state.buffer, patch);
					let reflush = !newer.is_empty();
					state.buffer.merge(newer);

					self.status.send_modify(|status| {
						status.state = SaveState::Error {
							message: e.to_string(),
						};
					});

					(reflush, self.config.error_display())
				}
			};

			state.revert = Some(Arc::clone(&self).schedule_revert(revert_after, state.generation));

			if reflush && !self.cancel.is_cancelled() {
				state.debounce = Some(Arc::clone(&self).schedule_flush());
			}
		}
		.boxed()
	}

	fn schedule_revert(self: Arc<Self>, delay: Duration, generation: u64) -> Timer {
		let cancel = self.cancel.clone();

		Timer::schedule(delay, &cancel, async move {
			if self.state.lock().await.generation != generation {
				return;
			}

			trace!(record_id = %self.id, "Save status back to idle");
			self.status.send_modify(|status| status.state = SaveState::Idle);
		})
	}
}
