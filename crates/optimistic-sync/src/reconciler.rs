use crate::{
	collection::RecordCollection,
	connection::ChangeSink,
	ledger::OptimisticLedger,
	record::{ChangeEvent, ChangeKind},
	suppression::SuppressionRegistry,
};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

/// Applies raw push stream events to the base collection.
///
/// Events for muted records are dropped, everything else lands whole in the collection and then
/// settles whatever optimistic changes it confirms.
#[derive(Debug, Clone)]
pub struct MessageReconciler {
	collection: Arc<RecordCollection>,
	suppression: SuppressionRegistry,
	ledger: Arc<OptimisticLedger>,
}

impl MessageReconciler {
	#[must_use]
	pub const fn new(
		collection: Arc<RecordCollection>,
		suppression: SuppressionRegistry,
		ledger: Arc<OptimisticLedger>,
	) -> Self {
		Self {
			collection,
			suppression,
			ledger,
		}
	}

	/// Returns whether the event changed the base collection
	pub async fn handle(&self, event: ChangeEvent) -> bool {
		let Some(id) = event.subject_id().cloned() else {
			warn!(kind = ?event.kind, "Dropping change event without a subject");
			return false;
		};

		if self.suppression.is_suppressed(&id).await {
			trace!(record_id = %id, kind = ?event.kind, "Dropping suppressed change event");
			return false;
		}

		let changed = match (event.kind, event.new) {
			(ChangeKind::Insert, Some(record)) => self.collection.prepend_if_absent(record).await,

			(ChangeKind::Update, Some(record)) => {
				let replaced = self.collection.replace(record).await.is_some();
				if !replaced {
					trace!(record_id = %id, "Update for a record we don't hold, ignoring");
				}
				replaced
			}

			(ChangeKind::Delete, _) => self.collection.remove(&id).await.is_some(),

			(ChangeKind::Insert | ChangeKind::Update, None) => {
				warn!(record_id = %id, kind = ?event.kind, "Change event is missing its new value");
				false
			}

			(ChangeKind::Unknown, _) => {
				debug!(record_id = %id, "Ignoring change event of unknown kind");
				false
			}
		};

		if changed {
			debug!(record_id = %id, kind = ?event.kind, "Applied change event");
			self.ledger.reconcile(&self.collection.snapshot().await).await;
		}

		changed
	}
}

#[async_trait]
impl ChangeSink for MessageReconciler {
	async fn on_change(&self, event: ChangeEvent) {
		self.handle(event).await;
	}
}
