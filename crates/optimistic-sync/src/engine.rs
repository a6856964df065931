use crate::{
	collection::RecordCollection,
	config::SyncConfig,
	connection::{ChangeStreamManager, PushChannel},
	error::Error,
	gateway::MutationGateway,
	ledger::OptimisticLedger,
	persister::{BatchedPersister, RecordUpdater, SaveStatus},
	pool::ConnectionPool,
	reconciler::MessageReconciler,
	record::{NewRecord, OwnerId, Record, RecordId, RecordPatch},
	sanitize::Sanitizer,
	store::{fetch_with_retry, ReadCache, RemoteStore},
	suppression::SuppressionRegistry,
	unsaved::UnsavedChanges,
};

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// State shared by the engine and the editors it hands out
struct Core {
	owner: OwnerId,
	store: Arc<dyn RemoteStore>,
	cache: Arc<ReadCache>,
	collection: Arc<RecordCollection>,
	ledger: Arc<OptimisticLedger>,
	suppression: SuppressionRegistry,
	gateway: MutationGateway,
	config: SyncConfig,
	cancel: CancellationToken,
}

impl Core {
	/// Value the caller currently sees, pending optimistic changes included
	async fn view(&self, id: &RecordId) -> Option<Record> {
		let base = self.collection.get(id).await?;

		Some(
			self.ledger
				.pending(id)
				.await
				.map_or(base, |entry| entry.proposed),
		)
	}

	async fn load(&self, use_cache: bool) -> Result<(), Error> {
		let cached = if use_cache {
			self.cache.get(&self.owner).await
		} else {
			None
		};

		let records = if let Some(records) = cached {
			debug!(owner_id = %self.owner, "Loaded records from cache");
			records
		} else {
			let records = fetch_with_retry(
				self.store.as_ref(),
				&self.owner,
				&self.config.reads,
				&self.cancel,
			)
			.await?;
			self.cache.put(self.owner.clone(), records.clone()).await;
			records
		};

		debug!(owner_id = %self.owner, count = records.len(), "Base collection loaded");

		self.collection.reset(records).await;
		self.ledger.reconcile(&self.collection.snapshot().await).await;

		Ok(())
	}

	async fn rollback(&self, id: &RecordId) -> bool {
		let Some(entry) = self.ledger.rollback(id).await else {
			return false;
		};

		// only undo a value we spliced in ourselves, anything else came from a newer writer
		let spliced = self
			.collection
			.get(id)
			.await
			.is_some_and(|current| current.same_content(&entry.proposed));

		if spliced {
			if let Some(prior) = entry.prior {
				self.collection.replace(prior).await;
			}
		}

		true
	}
}

#[async_trait]
impl RecordUpdater for Core {
	async fn current(&self, id: &RecordId) -> Option<Record> {
		if self.cancel.is_cancelled() {
			return None;
		}

		self.view(id).await
	}

	async fn update(&self, record: Record) -> Result<Record, Error> {
		let id = record.id.clone();

		let res = self.gateway.update(record).await;
		if res.as_ref().is_err_and(|e| !matches!(e, Error::ShutDown)) {
			// the editor keeps the failed edits in its buffer for a retry
			self.rollback(&id).await;
		}

		res
	}

	async fn suppress(&self, id: &RecordId, duration: Duration) {
		self.suppression.suppress(id, duration).await;
	}
}

/// Keeps one owner's records in sync with the remote store.
///
/// Changes show up right away through [`Self::collection`], are written through the mutation
/// gateway and get confirmed by either the write response or the push stream.
pub struct SyncEngine {
	core: Arc<Core>,
	streams: ChangeStreamManager,
	reconciler: Arc<MessageReconciler>,
	editors: Mutex<HashMap<RecordId, RecordEditor>>,
}

impl SyncEngine {
	#[must_use]
	pub fn new(
		owner: OwnerId,
		store: Arc<dyn RemoteStore>,
		channel: Arc<dyn PushChannel>,
		pool: Arc<ConnectionPool>,
		cache: Arc<ReadCache>,
		config: SyncConfig,
	) -> Self {
		let cancel = CancellationToken::new();

		let collection = Arc::new(RecordCollection::default());
		let ledger = Arc::new(OptimisticLedger::new(
			config.ledger.clone(),
			cancel.child_token(),
		));
		let suppression = SuppressionRegistry::new(cancel.child_token());

		let streams = ChangeStreamManager::new(
			channel,
			pool,
			config.pool.clone(),
			config.reconnect.clone(),
			cancel.child_token(),
		);

		let gateway = MutationGateway::new(
			owner.clone(),
			Arc::clone(&store),
			Arc::clone(&collection),
			Arc::clone(&ledger),
			suppression.clone(),
			Arc::clone(&cache),
			Sanitizer::new(&config.validation),
			streams.watch_connected(),
			config.suppression.gateway(),
			cancel.child_token(),
		);

		let reconciler = Arc::new(MessageReconciler::new(
			Arc::clone(&collection),
			suppression.clone(),
			Arc::clone(&ledger),
		));

		Self {
			core: Arc::new(Core {
				owner,
				store,
				cache,
				collection,
				ledger,
				suppression,
				gateway,
				config,
				cancel,
			}),
			streams,
			reconciler,
			editors: Mutex::default(),
		}
	}

	#[must_use]
	pub fn owner(&self) -> &OwnerId {
		&self.core.owner
	}

	/// Load the base collection, start the ledger sweep and open the change stream
	#[instrument(skip(self), fields(owner_id = %self.core.owner), err)]
	pub async fn start(&self) -> Result<(), Error> {
		if self.core.cancel.is_cancelled() {
			return Err(Error::ShutDown);
		}

		self.core.load(true).await?;
		self.core.ledger.start_sweeper().await;

		let reconciler = Arc::clone(&self.reconciler);
		self.streams
			.connect(self.core.owner.clone(), reconciler)
			.await;

		info!("Sync engine started");

		Ok(())
	}

	/// Rebuild the base collection from the remote store, bypassing the read cache
	#[instrument(skip(self), fields(owner_id = %self.core.owner), err)]
	pub async fn reload(&self) -> Result<(), Error> {
		if self.core.cancel.is_cancelled() {
			return Err(Error::ShutDown);
		}

		self.core.cache.invalidate(&self.core.owner).await;
		self.core.load(false).await
	}

	/// Base collection with every pending optimistic change applied
	pub async fn collection(&self) -> Vec<Record> {
		self.core
			.ledger
			.materialize(self.core.collection.snapshot().await)
			.await
	}

	pub async fn get(&self, id: &RecordId) -> Option<Record> {
		self.core.view(id).await
	}

	pub async fn create(&self, payload: NewRecord) -> Result<Record, Error> {
		self.ensure_running()?;
		self.core.gateway.create(payload).await
	}

	/// On failure the optimistic change stays visible until [`Self::rollback`] is called or it
	/// ages out
	pub async fn update(&self, record: Record) -> Result<Record, Error> {
		self.ensure_running()?;
		self.core.gateway.update(record).await
	}

	pub async fn delete(&self, id: &RecordId) -> Result<(), Error> {
		self.ensure_running()?;
		self.core.gateway.delete(id).await?;

		if let Some(editor) = self.editors.lock().await.remove(id) {
			editor.close().await;
		}

		Ok(())
	}

	/// Drop the pending optimistic change for `id` and put back the value it replaced.
	///
	/// Returns whether there was anything to roll back.
	#[instrument(skip(self))]
	pub async fn rollback(&self, id: &RecordId) -> bool {
		self.core.rollback(id).await
	}

	#[must_use]
	pub fn is_realtime_connected(&self) -> bool {
		self.streams.is_connected()
	}

	#[must_use]
	pub fn watch_connected(&self) -> watch::Receiver<bool> {
		self.streams.watch_connected()
	}

	/// Degraded mode: automatic reconnects gave up, only [`Self::retry_connection`] gets live
	/// updates back. Writes keep working.
	pub async fn connection_exhausted(&self) -> Option<Error> {
		if self.streams.is_circuit_open().await {
			Some(Error::ConnectionExhausted {
				attempts: self.streams.reconnect_attempts().await,
			})
		} else {
			None
		}
	}

	pub async fn retry_connection(&self) {
		if self.core.cancel.is_cancelled() {
			return;
		}

		self.streams.retry_connection().await;
	}

	/// Mute push stream events for `id`, for callers about to write it through another path
	pub async fn pause_for(&self, id: &RecordId, duration: Duration) {
		self.core.suppression.suppress(id, duration).await;
	}

	/// Editor for one record, shared by every caller asking for the same record
	pub async fn editor(&self, id: &RecordId) -> Result<RecordEditor, Error> {
		self.ensure_running()?;

		let mut editors = self.editors.lock().await;

		if let Some(editor) = editors.get(id) {
			return Ok(editor.clone());
		}

		let Some(record) = self.core.view(id).await else {
			return Err(Error::NotFound(id.clone()));
		};

		let core = Arc::clone(&self.core);
		let editor = RecordEditor::new(id.clone(), core, &self.core.config, &self.core.cancel);
		editor.observe(&record).await;

		editors.insert(id.clone(), editor.clone());

		Ok(editor)
	}

	pub async fn close_editor(&self, id: &RecordId) {
		if let Some(editor) = self.editors.lock().await.remove(id) {
			editor.close().await;
		}
	}

	/// Stop every timer, the change stream and all editors. Later calls fail with
	/// [`Error::ShutDown`].
	#[instrument(skip(self), fields(owner_id = %self.core.owner))]
	pub async fn shutdown(&self) {
		self.core.cancel.cancel();

		for (_, editor) in self.editors.lock().await.drain() {
			editor.close().await;
		}

		self.streams.shutdown().await;
		self.core.ledger.stop_sweeper().await;
		self.core.suppression.clear().await;

		info!("Sync engine shut down");
	}

	fn ensure_running(&self) -> Result<(), Error> {
		if self.core.cancel.is_cancelled() {
			warn!(owner_id = %self.core.owner, "Sync engine used after shutdown");
			return Err(Error::ShutDown);
		}

		Ok(())
	}
}

/// Per-record editing session: debounced persistence plus unsaved change tracking
#[derive(Clone)]
pub struct RecordEditor {
	persister: BatchedPersister,
	unsaved: Arc<Mutex<UnsavedChanges>>,
}

impl RecordEditor {
	fn new(
		id: RecordId,
		updater: Arc<dyn RecordUpdater>,
		config: &SyncConfig,
		cancel: &CancellationToken,
	) -> Self {
		Self {
			persister: BatchedPersister::new(
				id,
				updater,
				config.persister.clone(),
				config.suppression.persister(),
				cancel,
			),
			unsaved: Arc::default(),
		}
	}

	#[must_use]
	pub fn record_id(&self) -> &RecordId {
		self.persister.record_id()
	}

	pub async fn batched_save(&self, patch: RecordPatch) {
		self.persister.batched_save(patch).await;
	}

	pub async fn flush_now(&self) {
		self.persister.flush_now().await;
	}

	#[must_use]
	pub fn save_status(&self) -> SaveStatus {
		self.persister.status()
	}

	#[must_use]
	pub fn watch_status(&self) -> watch::Receiver<SaveStatus> {
		self.persister.watch_status()
	}

	/// Feed the live edited copy, returns whether it differs from the baseline
	pub async fn observe(&self, live: &Record) -> bool {
		self.unsaved.lock().await.observe(live)
	}

	pub async fn has_unsaved_changes(&self) -> bool {
		self.unsaved.lock().await.has_unsaved_changes()
	}

	pub async fn reset_changes(&self) {
		self.unsaved.lock().await.reset();
	}

	pub async fn close(&self) {
		self.persister.close().await;
	}
}
