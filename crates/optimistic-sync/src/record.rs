//! Decision records and the change events the push stream carries for them
//!
//! Business fields are opaque to the engine. Beyond them it only looks at the identifier, the
//! owner, the pipeline stage and the two timestamps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Prefix reserved for identifiers fabricated locally before the remote store assigns one
const TEMPORARY_PREFIX: &str = "temp-";

pub type SubscriptionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
	#[must_use]
	pub fn temporary() -> Self {
		Self(format!("{TEMPORARY_PREFIX}{}", Uuid::new_v4()))
	}

	#[must_use]
	pub fn is_temporary(&self) -> bool {
		self.0.starts_with(TEMPORARY_PREFIX)
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for RecordId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for RecordId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for OwnerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for OwnerId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for OwnerId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

/// Pipeline stage a decision moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	Backlog,
	Considering,
	Committed,
	InProgress,
	Completed,
	Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	pub id: RecordId,
	pub owner_id: OwnerId,
	pub stage: Stage,
	pub created_at: DateTime<Utc>,
	/// `None` means the record was never modified since creation
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl Record {
	/// Equality ignoring the modification instant, which every writer stamps differently
	#[must_use]
	pub fn same_content(&self, other: &Self) -> bool {
		self.id == other.id
			&& self.owner_id == other.owner_id
			&& self.stage == other.stage
			&& self.created_at == other.created_at
			&& self.fields == other.fields
	}

	#[must_use]
	pub fn field(&self, name: &str) -> Option<&Value> {
		self.fields.get(name)
	}

	/// Text content of a business field, if it holds a string
	#[must_use]
	pub fn text(&self, name: &str) -> Option<&str> {
		self.fields.get(name).and_then(Value::as_str)
	}
}

/// Payload for creating a record, the remote store assigns the identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
	pub owner_id: OwnerId,
	pub stage: Stage,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl NewRecord {
	#[must_use]
	pub fn new(owner_id: OwnerId, stage: Stage) -> Self {
		Self {
			owner_id,
			stage,
			fields: Map::new(),
		}
	}

	#[must_use]
	pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
		self.fields.insert(name.into(), value.into());
		self
	}

	/// Local stand-in shown until the remote store answers with the real record
	#[must_use]
	pub fn into_temporary(self, now: DateTime<Utc>) -> Record {
		Record {
			id: RecordId::temporary(),
			owner_id: self.owner_id,
			stage: self.stage,
			created_at: now,
			updated_at: None,
			fields: self.fields,
		}
	}
}

/// Field-level edit, later values for the same field win
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stage: Option<Stage>,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl RecordPatch {
	#[must_use]
	pub fn field(name: impl Into<String>, value: impl Into<Value>) -> Self {
		let mut fields = Map::new();
		fields.insert(name.into(), value.into());
		Self {
			stage: None,
			fields,
		}
	}

	#[must_use]
	pub fn stage(stage: Stage) -> Self {
		Self {
			stage: Some(stage),
			fields: Map::new(),
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.stage.is_none() && self.fields.is_empty()
	}

	pub fn merge(&mut self, newer: Self) {
		if newer.stage.is_some() {
			self.stage = newer.stage;
		}

		self.fields.extend(newer.fields);
	}

	#[must_use]
	pub fn apply_to(&self, mut record: Record) -> Record {
		if let Some(stage) = self.stage {
			record.stage = stage;
		}

		for (name, value) in &self.fields {
			record.fields.insert(name.clone(), value.clone());
		}

		record
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
	Insert,
	Update,
	Delete,
	#[serde(other)]
	Unknown,
}

/// Only the identifier of a prior row is needed, whatever else the stream sends is ignored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
	pub id: RecordId,
}

/// Raw change broadcast by the push stream, uninterpreted until it reaches the reconciler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
	pub kind: ChangeKind,
	#[serde(default, rename = "new_value")]
	pub new: Option<Record>,
	#[serde(default, rename = "old_value")]
	pub old: Option<RecordRef>,
}

impl ChangeEvent {
	#[must_use]
	pub const fn insert(record: Record) -> Self {
		Self {
			kind: ChangeKind::Insert,
			new: Some(record),
			old: None,
		}
	}

	#[must_use]
	pub fn update(record: Record) -> Self {
		Self {
			kind: ChangeKind::Update,
			old: Some(RecordRef {
				id: record.id.clone(),
			}),
			new: Some(record),
		}
	}

	#[must_use]
	pub const fn delete(id: RecordId) -> Self {
		Self {
			kind: ChangeKind::Delete,
			new: None,
			old: Some(RecordRef { id }),
		}
	}

	/// Identifier the event is about, taken from the new value first
	#[must_use]
	pub fn subject_id(&self) -> Option<&RecordId> {
		self.new
			.as_ref()
			.map(|record| &record.id)
			.or_else(|| self.old.as_ref().map(|old| &old.id))
	}
}
