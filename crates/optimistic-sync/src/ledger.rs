//! Optimistic mutation ledger
//!
//! Tracks local changes the remote store has not confirmed yet and layers them over the confirmed
//! collection. At most one entry exists per record: a newer proposal replaces the older one, so
//! intermediate optimistic states can be skipped in favour of the latest user intent.

use crate::{
	config::LedgerConfig,
	error::Error,
	record::{Record, RecordId},
};

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::{
	spawn,
	sync::Mutex,
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct OptimisticEntry {
	pub id: RecordId,
	/// Base value when the change was proposed, `None` for records that did not exist yet
	pub prior: Option<Record>,
	pub proposed: Record,
	pub issued_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
	pub confirmed: Vec<RecordId>,
	pub timed_out: Vec<RecordId>,
}

impl ReconcileReport {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.confirmed.is_empty() && self.timed_out.is_empty()
	}
}

#[derive(Debug)]
pub struct OptimisticLedger {
	entries: Arc<Mutex<HashMap<RecordId, OptimisticEntry>>>,
	config: LedgerConfig,
	sweeper: Mutex<Option<DropGuard>>,
	cancel: CancellationToken,
}

impl OptimisticLedger {
	#[must_use]
	pub fn new(config: LedgerConfig, cancel: CancellationToken) -> Self {
		Self {
			entries: Arc::default(),
			config,
			sweeper: Mutex::new(None),
			cancel,
		}
	}

	/// Record `proposed` as the pending value of its record, replacing any earlier proposal
	pub async fn apply(&self, proposed: Record, prior: Option<Record>) {
		let id = proposed.id.clone();
		let mut entries = self.entries.lock().await;

		// keep the value from before the first unconfirmed proposal, so a rollback restores what
		// the remote store actually holds
		let prior = entries
			.remove(&id)
			.map_or(prior, |replaced| replaced.prior);

		debug!(record_id = %id, pending = entries.len() + 1, "Applying optimistic change");

		entries.insert(
			id.clone(),
			OptimisticEntry {
				id,
				prior,
				proposed,
				issued_at: Instant::now(),
			},
		);
	}

	/// Drop the pending entry right away, the originating write is known to have failed
	pub async fn rollback(&self, id: &RecordId) -> Option<OptimisticEntry> {
		let entry = self.entries.lock().await.remove(id);

		if entry.is_some() {
			debug!(record_id = %id, "Rolled back optimistic change");
		}

		entry
	}

	/// Drop the pending entry because the write response already settled it
	pub async fn settle(&self, id: &RecordId) {
		if self.entries.lock().await.remove(id).is_some() {
			trace!(record_id = %id, "Optimistic change settled by write response");
		}
	}

	pub async fn has_pending(&self, id: &RecordId) -> bool {
		self.entries.lock().await.contains_key(id)
	}

	pub async fn pending(&self, id: &RecordId) -> Option<OptimisticEntry> {
		self.entries.lock().await.get(id).cloned()
	}

	pub async fn pending_count(&self) -> usize {
		self.entries.lock().await.len()
	}

	/// Base collection with every pending proposal swapped in, stamped with the current time so
	/// consumers can tell optimistic values apart
	pub async fn materialize(&self, base: Vec<Record>) -> Vec<Record> {
		let entries = self.entries.lock().await;

		if entries.is_empty() {
			return base;
		}

		let now = Utc::now();

		base.into_iter()
			.map(|record| {
				entries.get(&record.id).map_or(record, |entry| {
					let mut proposed = entry.proposed.clone();
					proposed.updated_at = Some(now);
					proposed
				})
			})
			.collect()
	}

	/// Settle pending entries against a freshly changed base collection.
	///
	/// Entries whose record now matches the proposal are confirmed, entries older than the
	/// confirm timeout are dropped whatever the base says. A record missing from the base keeps
	/// its entry until it ages out, absent and not-yet-arrived look the same.
	pub async fn reconcile(&self, base: &[Record]) -> ReconcileReport {
		let mut entries = self.entries.lock().await;
		let mut report = ReconcileReport::default();

		entries.retain(|id, entry| {
			let confirmed = base
				.iter()
				.find(|record| &record.id == id)
				.is_some_and(|record| record.same_content(&entry.proposed));

			if confirmed {
				report.confirmed.push(id.clone());
				return false;
			}

			if entry.issued_at.elapsed() > self.config.confirm_timeout() {
				warn!(
					record_id = %id,
					error = %Error::ConflictTimeout(id.clone()),
					"Trusting latest base state"
				);
				report.timed_out.push(id.clone());
				return false;
			}

			true
		});

		if !report.is_empty() {
			debug!(
				confirmed = report.confirmed.len(),
				timed_out = report.timed_out.len(),
				pending = entries.len(),
				"Reconciled optimistic ledger"
			);
		}

		report
	}

	/// Backstop against missed reconciliation triggers, drops entries past the sweep max age
	pub async fn sweep(&self) -> Vec<RecordId> {
		sweep_entries(&self.entries, &self.config).await
	}

	/// Run [`Self::sweep`] periodically until the ledger's token is cancelled or the sweeper is
	/// stopped. Starting it twice keeps a single sweeper.
	pub async fn start_sweeper(&self) {
		if self.config.sweep_interval().is_zero() {
			warn!("Zero sweep interval, stale optimistic changes rely on reconciliation alone");
			return;
		}

		let stop = self.cancel.child_token();
		let entries = Arc::clone(&self.entries);
		let config = self.config.clone();

		spawn({
			let stop = stop.clone();

			async move {
				let period = config.sweep_interval();
				let mut ticks = interval_at(Instant::now() + period, period);
				ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

				loop {
					tokio::select! {
						biased;

						() = stop.cancelled() => break,
						_ = ticks.tick() => {
							sweep_entries(&entries, &config).await;
						}
					}
				}
			}
		});

		*self.sweeper.lock().await = Some(stop.drop_guard());
	}

	pub async fn stop_sweeper(&self) {
		self.sweeper.lock().await.take();
	}

	pub async fn clear(&self) {
		self.entries.lock().await.clear();
	}
}

async fn sweep_entries(
	entries: &Mutex<HashMap<RecordId, OptimisticEntry>>,
	config: &LedgerConfig,
) -> Vec<RecordId> {
	let mut swept = Vec::new();

	entries.lock().await.retain(|id, entry| {
		let stale = entry.issued_at.elapsed() > config.sweep_max_age();
		if stale {
			swept.push(id.clone());
		}
		!stale
	});

	if !swept.is_empty() {
		warn!(swept = swept.len(), "Swept stale optimistic changes");
	}

	swept
}
