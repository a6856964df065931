use crate::{record::RecordId, store::StoreError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("network error: {0}")]
	Network(String),
	#[error("remote store rejected the write: {0}")]
	Rejected(String),
	#[error("optimistic change for <id='{0}'> was not confirmed in time")]
	ConflictTimeout(RecordId),
	#[error("realtime connection exhausted after {attempts} attempts")]
	ConnectionExhausted { attempts: u32 },
	#[error("record not found: <id='{0}'>")]
	NotFound(RecordId),
	#[error("sync engine was shut down")]
	ShutDown,

	#[error("failed to parse sync config: {0}")]
	Config(#[from] serde_json::Error),
	#[error("invalid sync config: {0}")]
	InvalidConfig(String),
}

impl Error {
	/// Only transient transport failures are worth retrying, everything else needs the caller.
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		matches!(self, Self::Network(_))
	}
}

impl From<StoreError> for Error {
	fn from(e: StoreError) -> Self {
		match e {
			StoreError::Network(msg) => Self::Network(msg),
			StoreError::Validation(msg) => Self::Rejected(msg),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("field '{field}' is required")]
	Required { field: String },
	#[error("field '{field}' must be at least {min} characters, got {actual}")]
	TooShort {
		field: String,
		min: usize,
		actual: usize,
	},
	#[error("field '{field}' must be at most {max} characters, got {actual}")]
	TooLong {
		field: String,
		max: usize,
		actual: usize,
	},
	#[error("field '{field}' must be text")]
	NotText { field: String },
}
