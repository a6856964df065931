use crate::{
	collection::RecordCollection,
	error::Error,
	ledger::OptimisticLedger,
	record::{NewRecord, OwnerId, Record, RecordId},
	sanitize::Sanitizer,
	store::{ReadCache, RemoteStore, StoreError},
	suppression::SuppressionRegistry,
};

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// The only path through which local state may request remote writes.
///
/// Free text is validated before anything else happens, so a validation failure never touches
/// the collection, the ledger or the network. Writes are never retried here, failures go back to
/// the caller who decides between retrying and reverting. Once the gateway's token is cancelled
/// in-flight writes resolve to [`Error::ShutDown`] and their responses are never applied.
pub struct MutationGateway {
	owner: OwnerId,
	store: Arc<dyn RemoteStore>,
	collection: Arc<RecordCollection>,
	ledger: Arc<OptimisticLedger>,
	suppression: SuppressionRegistry,
	cache: Arc<ReadCache>,
	sanitizer: Sanitizer,
	connected: watch::Receiver<bool>,
	echo_window: Duration,
	cancel: CancellationToken,
}

impl MutationGateway {
	#[allow(clippy::too_many_arguments)]
	#[must_use]
	pub fn new(
		owner: OwnerId,
		store: Arc<dyn RemoteStore>,
		collection: Arc<RecordCollection>,
		ledger: Arc<OptimisticLedger>,
		suppression: SuppressionRegistry,
		cache: Arc<ReadCache>,
		sanitizer: Sanitizer,
		connected: watch::Receiver<bool>,
		echo_window: Duration,
		cancel: CancellationToken,
	) -> Self {
		Self {
			owner,
			store,
			collection,
			ledger,
			suppression,
			cache,
			sanitizer,
			connected,
			echo_window,
			cancel,
		}
	}

	fn stream_connected(&self) -> bool {
		*self.connected.borrow()
	}

	fn ensure_running(&self) -> Result<(), Error> {
		if self.cancel.is_cancelled() {
			return Err(Error::ShutDown);
		}

		Ok(())
	}

	/// Race a remote write against shutdown
	async fn write<T>(
		&self,
		write: impl Future<Output = Result<T, StoreError>> + Send,
	) -> Result<T, Error> {
		tokio::select! {
			biased;

			() = self.cancel.cancelled() => {
				trace!(owner_id = %self.owner, "Gateway shut down, abandoning remote write");
				Err(Error::ShutDown)
			}
			res = write => res.map_err(Into::into),
		}
	}

	/// Create a record, visible right away under a temporary identifier until the remote store
	/// answers with the real one
	#[instrument(skip_all, fields(owner_id = %self.owner), err)]
	pub async fn create(&self, payload: NewRecord) -> Result<Record, Error> {
		self.ensure_running()?;
		let payload = self.sanitizer.check_new(payload)?;

		let temporary = payload.clone().into_temporary(Utc::now());
		let temporary_id = temporary.id.clone();

		self.collection.prepend_if_absent(temporary.clone()).await;
		self.ledger.apply(temporary, None).await;

		match self.write(self.store.insert(payload)).await {
			Ok(created) => {
				debug!(%temporary_id, record_id = %created.id, "Remote store created record");

				self.collection
					.replace_temporary(&temporary_id, created.clone())
					.await;
				self.ledger.settle(&temporary_id).await;
				self.cache.invalidate(&self.owner).await;

				Ok(created)
			}

			Err(Error::ShutDown) => Err(Error::ShutDown),

			Err(e) => {
				self.collection.remove(&temporary_id).await;
				self.ledger.rollback(&temporary_id).await;

				Err(e)
			}
		}
	}

	/// Write the full value of `record`.
	///
	/// On failure the optimistic entry stays in the ledger, the caller rolls it back.
	#[instrument(skip_all, fields(owner_id = %self.owner, record_id = %record.id), err)]
	pub async fn update(&self, record: Record) -> Result<Record, Error> {
		self.ensure_running()?;

		if record.id.is_temporary() {
			return Err(Error::NotFound(record.id));
		}

		let record = self.sanitizer.check_record(record)?;
		let id = record.id.clone();

		let prior = self.collection.get(&id).await;
		self.ledger.apply(record.clone(), prior).await;

		if !self.stream_connected() {
			self.collection.replace(record.clone()).await;
		}

		// must be in place before the write is issued, the echo can beat the response
		self.suppression.suppress(&id, self.echo_window).await;

		let updated = self.write(self.store.update(record)).await?;

		// our own echo is muted, so the base only moves forward through the write response
		self.collection.replace(updated.clone()).await;
		self.ledger.reconcile(&self.collection.snapshot().await).await;
		self.cache.invalidate(&self.owner).await;

		Ok(updated)
	}

	/// Delete a record remotely, the local copy only goes away once the remote store agreed
	#[instrument(skip(self), fields(owner_id = %self.owner), err)]
	pub async fn delete(&self, id: &RecordId) -> Result<(), Error> {
		self.ensure_running()?;

		if id.is_temporary() {
			return Err(Error::NotFound(id.clone()));
		}

		self.write(self.store.delete(id)).await?;

		if self.stream_connected() {
			debug!(record_id = %id, "Waiting for the stream to remove the deleted record");
		} else if self.collection.remove(id).await.is_none() {
			warn!(record_id = %id, "Deleted record was not in the local collection");
		}

		self.ledger.settle(id).await;
		self.cache.invalidate(&self.owner).await;

		Ok(())
	}
}
