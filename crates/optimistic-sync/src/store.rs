use crate::{
	config::ReadConfig,
	error::Error,
	record::{NewRecord, OwnerId, Record, RecordId},
};

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use tokio::{
	sync::Mutex,
	time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
	#[error("network: {0}")]
	Network(String),
	#[error("validation: {0}")]
	Validation(String),
}

/// Request/response access to the remote store holding the records
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
	async fn list(&self, owner: &OwnerId) -> Result<Vec<Record>, StoreError>;

	/// The remote store assigns the identifier and creation instant
	async fn insert(&self, payload: NewRecord) -> Result<Record, StoreError>;

	/// Returns the authoritative value after the write
	async fn update(&self, record: Record) -> Result<Record, StoreError>;

	async fn delete(&self, id: &RecordId) -> Result<(), StoreError>;
}

/// List the owner's records, retrying network failures with exponential backoff.
///
/// Validation-class failures are returned right away, and cancelling `cancel` aborts both an
/// in-flight read and a pending backoff with [`Error::ShutDown`].
pub async fn fetch_with_retry(
	store: &dyn RemoteStore,
	owner: &OwnerId,
	config: &ReadConfig,
	cancel: &CancellationToken,
) -> Result<Vec<Record>, Error> {
	let attempts = config.attempts.max(1);
	let mut attempt = 1;

	loop {
		let res = tokio::select! {
			biased;

			() = cancel.cancelled() => return Err(Error::ShutDown),
			res = store.list(owner) => res,
		};

		match res {
			Ok(records) => {
				trace!(%owner, attempt, count = records.len(), "Fetched records");
				return Ok(records);
			}

			Err(StoreError::Network(e)) if attempt < attempts => {
				let delay = config.base_delay() * 2u32.saturating_pow(attempt - 1);
				warn!(%owner, attempt, ?delay, error = %e, "Failed to fetch records, retrying");

				tokio::select! {
					biased;

					() = cancel.cancelled() => return Err(Error::ShutDown),
					() = sleep(delay) => {}
				}

				attempt += 1;
			}

			Err(e) => return Err(e.into()),
		}
	}
}

#[derive(Debug)]
struct CachedRead {
	records: Vec<Record>,
	fetched_at: Instant,
}

/// Short-lived per-owner cache in front of the list read
#[derive(Debug)]
pub struct ReadCache {
	ttl: Duration,
	entries: Mutex<HashMap<OwnerId, CachedRead>>,
}

impl Default for ReadCache {
	fn default() -> Self {
		Self::new(DEFAULT_CACHE_TTL)
	}
}

impl ReadCache {
	#[must_use]
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: Mutex::default(),
		}
	}

	pub async fn get(&self, owner: &OwnerId) -> Option<Vec<Record>> {
		let mut entries = self.entries.lock().await;

		match entries.get(owner) {
			Some(cached) if cached.fetched_at.elapsed() < self.ttl => Some(cached.records.clone()),
			Some(_) => {
				trace!(%owner, "Cached read expired");
				entries.remove(owner);
				None
			}
			None => None,
		}
	}

	pub async fn put(&self, owner: OwnerId, records: Vec<Record>) {
		self.entries.lock().await.insert(
			owner,
			CachedRead {
				records,
				fetched_at: Instant::now(),
			},
		);
	}

	pub async fn invalidate(&self, owner: &OwnerId) {
		if self.entries.lock().await.remove(owner).is_some() {
			debug!(%owner, "Invalidated cached read");
		}
	}

	pub async fn clear(&self) {
		self.entries.lock().await.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::atomic::{AtomicU32, Ordering};

	struct FlakyStore {
		failures: u32,
		rejected: bool,
		calls: AtomicU32,
	}

	#[async_trait]
	impl RemoteStore for FlakyStore {
		async fn list(&self, _owner: &OwnerId) -> Result<Vec<Record>, StoreError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

			if self.rejected {
				Err(StoreError::Validation("bad owner".to_string()))
			} else if call <= self.failures {
				Err(StoreError::Network("offline".to_string()))
			} else {
				Ok(Vec::new())
			}
		}

		async fn insert(&self, _payload: NewRecord) -> Result<Record, StoreError> {
			unimplemented!()
		}

		async fn update(&self, record: Record) -> Result<Record, StoreError> {
			Ok(record)
		}

		async fn delete(&self, _id: &RecordId) -> Result<(), StoreError> {
			Ok(())
		}
	}

	fn store(failures: u32, rejected: bool) -> FlakyStore {
		FlakyStore {
			failures,
			rejected,
			calls: AtomicU32::new(0),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn retries_network_failures_with_backoff() {
		let store = store(2, false);
		let started = Instant::now();

		let records = fetch_with_retry(
			&store,
			&OwnerId::from("user-1"),
			&ReadConfig::default(),
			&CancellationToken::new(),
		)
		.await
		.unwrap();

		assert!(records.is_empty());
		assert_eq!(store.calls.load(Ordering::SeqCst), 3);
		// 1s then 2s of backoff
		assert!(started.elapsed() >= Duration::from_millis(3_000));
	}

	#[tokio::test(start_paused = true)]
	async fn gives_up_after_the_last_attempt() {
		let store = store(10, false);

		let res = fetch_with_retry(
			&store,
			&OwnerId::from("user-1"),
			&ReadConfig::default(),
			&CancellationToken::new(),
		)
		.await;

		assert!(matches!(res, Err(Error::Network(_))));
		assert_eq!(store.calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn validation_failures_are_not_retried() {
		let store = store(0, true);

		let res = fetch_with_retry(
			&store,
			&OwnerId::from("user-1"),
			&ReadConfig::default(),
			&CancellationToken::new(),
		)
		.await;

		assert!(matches!(res, Err(Error::Rejected(_))));
		assert_eq!(store.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_aborts_the_backoff() {
		let store = store(10, false);
		let cancel = CancellationToken::new();

		tokio::spawn({
			let cancel = cancel.clone();
			async move {
				sleep(Duration::from_millis(500)).await;
				cancel.cancel();
			}
		});

		let res = fetch_with_retry(
			&store,
			&OwnerId::from("user-1"),
			&ReadConfig::default(),
			&cancel,
		)
		.await;

		assert!(matches!(res, Err(Error::ShutDown)));
		assert_eq!(store.calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cached_reads_expire() {
		let cache = ReadCache::new(Duration::from_secs(30));
		let owner = OwnerId::from("user-1");

		cache.put(owner.clone(), Vec::new()).await;
		assert!(cache.get(&owner).await.is_some());

		sleep(Duration::from_secs(30)).await;
		assert!(cache.get(&owner).await.is_none());

		cache.put(owner.clone(), Vec::new()).await;
		cache.invalidate(&owner).await;
		assert!(cache.get(&owner).await.is_none());
	}
}
