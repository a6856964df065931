use crate::record::{Record, RecordId};

use tokio::sync::RwLock;
use tracing::trace;

/// Confirmed base collection held by the client, most recent first.
///
/// Identifiers are unique within the collection, every mutation keeps it that way.
#[derive(Debug, Default)]
pub struct RecordCollection {
	records: RwLock<Vec<Record>>,
}

impl RecordCollection {
	#[must_use]
	pub fn new(records: Vec<Record>) -> Self {
		Self {
			records: RwLock::new(dedup(records)),
		}
	}

	pub async fn snapshot(&self) -> Vec<Record> {
		self.records.read().await.clone()
	}

	pub async fn get(&self, id: &RecordId) -> Option<Record> {
		self.records
			.read()
			.await
			.iter()
			.find(|record| &record.id == id)
			.cloned()
	}

	pub async fn contains(&self, id: &RecordId) -> bool {
		self.records
			.read()
			.await
			.iter()
			.any(|record| &record.id == id)
	}

	pub async fn len(&self) -> usize {
		self.records.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.records.read().await.is_empty()
	}

	/// Returns whether the record was inserted
	pub async fn prepend_if_absent(&self, record: Record) -> bool {
		let mut records = self.records.write().await;

		if records.iter().any(|existing| existing.id == record.id) {
			trace!(record_id = %record.id, "Record already present, skipping insert");
			return false;
		}

		records.insert(0, record);
		true
	}

	/// Replace the full value of a present record, returns the previous value
	pub async fn replace(&self, record: Record) -> Option<Record> {
		self.records
			.write()
			.await
			.iter_mut()
			.find(|existing| existing.id == record.id)
			.map(|existing| std::mem::replace(existing, record))
	}

	/// Replace if present, prepend otherwise
	pub async fn upsert(&self, record: Record) {
		let mut records = self.records.write().await;

		if let Some(existing) = records.iter_mut().find(|existing| existing.id == record.id) {
			*existing = record;
		} else {
			records.insert(0, record);
		}
	}

	pub async fn remove(&self, id: &RecordId) -> Option<Record> {
		let mut records = self.records.write().await;

		records
			.iter()
			.position(|record| &record.id == id)
			.map(|idx| records.remove(idx))
	}

	/// Swap a locally fabricated record for the one the remote store created.
	///
	/// If the stream already delivered the remote record, the temporary one is simply dropped and
	/// the remote value is overwritten, never merged.
	pub async fn replace_temporary(&self, temporary_id: &RecordId, record: Record) {
		let mut records = self.records.write().await;

		let temporary_idx = records.iter().position(|existing| &existing.id == temporary_id);
		let remote_idx = records.iter().position(|existing| existing.id == record.id);

		match (temporary_idx, remote_idx) {
			(Some(temporary_idx), None) => records[temporary_idx] = record,
			(Some(temporary_idx), Some(remote_idx)) => {
				records[remote_idx] = record;
				records.remove(temporary_idx);
			}
			(None, Some(remote_idx)) => records[remote_idx] = record,
			(None, None) => records.insert(0, record),
		}
	}

	pub async fn reset(&self, records: Vec<Record>) {
		*self.records.write().await = dedup(records);
	}
}

fn dedup(records: Vec<Record>) -> Vec<Record> {
	let mut seen = std::collections::HashSet::with_capacity(records.len());

	records
		.into_iter()
		.filter(|record| seen.insert(record.id.clone()))
		.collect()
}
