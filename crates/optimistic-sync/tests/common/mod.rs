#![allow(dead_code)]

use sd_optimistic_sync::{
	ChangeEvent, ChannelStatus, ConnectionPool, Error, NewRecord, OwnerId, PushChannel, ReadCache,
	Record, RecordId, RemoteStore, Stage, StoreError, Subscription, SubscriptionId, SyncConfig,
	SyncEngine,
};

use std::{
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_channel as chan;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map};
use tokio::time::sleep;

pub const OWNER: &str = "user-1";

pub fn record(id: &str, stage: Stage, title: &str) -> Record {
	let mut fields = Map::new();
	fields.insert("title".to_string(), json!(title));

	Record {
		id: id.into(),
		owner_id: OwnerId::from(OWNER),
		stage,
		created_at: "2024-05-01T10:00:00Z".parse().unwrap(),
		updated_at: None,
		fields,
	}
}

struct FakeSubscription {
	owner: OwnerId,
	id: SubscriptionId,
	events_tx: chan::Sender<ChangeEvent>,
	status_tx: chan::Sender<ChannelStatus>,
	open: bool,
}

/// Push channel fed by the tests or by a [`MemoryStore`] broadcasting its writes
#[derive(Default)]
pub struct MemoryChannel {
	subscriptions: Mutex<Vec<FakeSubscription>>,
	pub refuse: AtomicBool,
	pub subscribe_calls: AtomicU32,
}

impl MemoryChannel {
	pub fn open_subscriptions(&self) -> usize {
		self.subscriptions
			.lock()
			.unwrap()
			.iter()
			.filter(|sub| sub.open)
			.count()
	}

	pub fn publish(&self, event: &ChangeEvent) {
		let owner = event.new.as_ref().map(|record| record.owner_id.clone());

		for sub in self.subscriptions.lock().unwrap().iter() {
			if sub.open && owner.as_ref().map_or(true, |owner| owner == &sub.owner) {
				sub.events_tx.try_send(event.clone()).unwrap();
			}
		}
	}

	/// Simulate the transport dropping every open subscription
	pub fn drop_all(&self) {
		for sub in self.subscriptions.lock().unwrap().iter() {
			if sub.open {
				sub.status_tx.try_send(ChannelStatus::Closed).unwrap();
			}
		}
	}
}

#[async_trait]
impl PushChannel for MemoryChannel {
	async fn subscribe(&self, owner: &OwnerId, id: SubscriptionId) -> Result<Subscription, Error> {
		self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

		if self.refuse.load(Ordering::SeqCst) {
			return Err(Error::Network("push channel unavailable".to_string()));
		}

		let (events_tx, events) = chan::unbounded();
		let (status_tx, status) = chan::unbounded();
		status_tx.try_send(ChannelStatus::Subscribed).unwrap();

		self.subscriptions.lock().unwrap().push(FakeSubscription {
			owner: owner.clone(),
			id,
			events_tx,
			status_tx,
			open: true,
		});

		Ok(Subscription { events, status })
	}

	async fn unsubscribe(&self, id: SubscriptionId) {
		for sub in self.subscriptions.lock().unwrap().iter_mut() {
			if sub.id == id {
				sub.open = false;
			}
		}
	}
}

/// Remote store kept in memory, with failure injection and call counting
pub struct MemoryStore {
	records: Mutex<Vec<Record>>,
	next_id: AtomicU64,
	channel: Option<Arc<MemoryChannel>>,
	pub write_delay: Duration,
	pub fail_writes: AtomicBool,
	pub failing_reads: AtomicU32,
	pub list_calls: AtomicU32,
	pub updates: Mutex<Vec<Record>>,
}

impl MemoryStore {
	pub fn new(records: Vec<Record>, channel: Option<Arc<MemoryChannel>>) -> Self {
		Self {
			records: Mutex::new(records),
			next_id: AtomicU64::new(42),
			channel,
			write_delay: Duration::ZERO,
			fail_writes: AtomicBool::new(false),
			failing_reads: AtomicU32::new(0),
			list_calls: AtomicU32::new(0),
			updates: Mutex::new(Vec::new()),
		}
	}

	pub fn with_write_delay(mut self, delay: Duration) -> Self {
		self.write_delay = delay;
		self
	}

	pub fn stored(&self, id: &str) -> Option<Record> {
		self.records
			.lock()
			.unwrap()
			.iter()
			.find(|record| record.id.as_str() == id)
			.cloned()
	}

	pub fn update_calls(&self) -> usize {
		self.updates.lock().unwrap().len()
	}

	/// Another writer changing a record, broadcast like any other write
	pub fn external_update(&self, mut record: Record) {
		record.updated_at = Some(Utc::now());
		self.put(record.clone());
		self.broadcast(&ChangeEvent::update(record));
	}

	fn put(&self, record: Record) {
		let mut records = self.records.lock().unwrap();

		if let Some(existing) = records.iter_mut().find(|existing| existing.id == record.id) {
			*existing = record;
		} else {
			records.insert(0, record);
		}
	}

	fn broadcast(&self, event: &ChangeEvent) {
		if let Some(channel) = &self.channel {
			channel.publish(event);
		}
	}

	async fn write(&self) -> Result<(), StoreError> {
		sleep(self.write_delay).await;

		if self.fail_writes.load(Ordering::SeqCst) {
			Err(StoreError::Network("connection reset".to_string()))
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl RemoteStore for MemoryStore {
	async fn list(&self, owner: &OwnerId) -> Result<Vec<Record>, StoreError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);

		let failing = self.failing_reads.load(Ordering::SeqCst);
		if failing > 0 {
			self.failing_reads.store(failing - 1, Ordering::SeqCst);
			return Err(StoreError::Network("timed out".to_string()));
		}

		Ok(self
			.records
			.lock()
			.unwrap()
			.iter()
			.filter(|record| &record.owner_id == owner)
			.cloned()
			.collect())
	}

	async fn insert(&self, payload: NewRecord) -> Result<Record, StoreError> {
		self.write().await?;

		let mut record = payload.into_temporary(Utc::now());
		record.id = RecordId::from(format!(
			"r-{}",
			self.next_id.fetch_add(1, Ordering::SeqCst)
		));

		self.put(record.clone());
		self.broadcast(&ChangeEvent::insert(record.clone()));

		Ok(record)
	}

	async fn update(&self, mut record: Record) -> Result<Record, StoreError> {
		self.updates.lock().unwrap().push(record.clone());
		self.write().await?;

		record.updated_at = Some(Utc::now());
		self.put(record.clone());
		self.broadcast(&ChangeEvent::update(record.clone()));

		Ok(record)
	}

	async fn delete(&self, id: &RecordId) -> Result<(), StoreError> {
		self.write().await?;

		self.records.lock().unwrap().retain(|record| &record.id != id);
		self.broadcast(&ChangeEvent::delete(id.clone()));

		Ok(())
	}
}

pub struct Harness {
	pub engine: Arc<SyncEngine>,
	pub store: Arc<MemoryStore>,
	pub channel: Arc<MemoryChannel>,
	pub pool: Arc<ConnectionPool>,
	pub cache: Arc<ReadCache>,
}

impl Harness {
	pub fn new(store: MemoryStore, channel: Arc<MemoryChannel>) -> Self {
		Self::with_pool(store, channel, Arc::new(ConnectionPool::default()))
	}

	pub fn with_pool(store: MemoryStore, channel: Arc<MemoryChannel>, pool: Arc<ConnectionPool>) -> Self {
		let config = SyncConfig::default();
		let store = Arc::new(store);
		let cache = Arc::new(ReadCache::new(config.reads.cache_ttl()));

		let engine = Arc::new(SyncEngine::new(
			OwnerId::from(OWNER),
			Arc::clone(&store) as Arc<dyn RemoteStore>,
			Arc::clone(&channel) as Arc<dyn PushChannel>,
			Arc::clone(&pool),
			Arc::clone(&cache),
			config,
		));

		Self {
			engine,
			store,
			channel,
			pool,
			cache,
		}
	}

	/// Start the engine and let the change stream settle
	pub async fn start(&self) {
		self.engine.start().await.unwrap();
		sleep(Duration::from_millis(10)).await;
	}
}

/// Harness whose store broadcasts every write on the push channel
pub fn connected(records: Vec<Record>) -> Harness {
	let channel = Arc::new(MemoryChannel::default());
	Harness::new(
		MemoryStore::new(records, Some(Arc::clone(&channel))),
		channel,
	)
}

/// Harness whose push channel refuses every subscription
pub fn disconnected(records: Vec<Record>) -> Harness {
	let channel = Arc::new(MemoryChannel::default());
	channel.refuse.store(true, Ordering::SeqCst);
	Harness::new(MemoryStore::new(records, None), channel)
}
