//!
//! # Optimistic Sync
//!
//! Keeps a client-held collection of decision records consistent with a remote store that is
//! reachable through two independent channels: the request/response writes this client issues
//! itself, and a push stream broadcasting every change any writer makes to the same records.
//!
//! The engine is built from small pieces that each own one concern:
//! - [`ReconnectPolicy`]: backoff and circuit breaker for the push stream;
//! - [`ChangeStreamManager`]: one push subscription per owner, limited by a shared [`ConnectionPool`];
//! - [`MessageReconciler`] and [`SuppressionRegistry`]: turn stream events into collection
//!   mutations, muting the echo of our own writes;
//! - [`OptimisticLedger`]: local-only changes layered over the confirmed collection;
//! - [`MutationGateway`]: the only path to remote writes, with validation and sanitization;
//! - [`BatchedPersister`]: coalesces field edits into a single update after an idle window;
//! - [`UnsavedChanges`]: structural diff between an edit baseline and the live copy.
//!
//! [`SyncEngine`] wires all of them together behind the caller-facing API.
//!
//! ## Basic example
//!
//! ```ignore
//! use sd_optimistic_sync::{ConnectionPool, NewRecord, OwnerId, ReadCache, Stage, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let engine = SyncEngine::new(
//! 	OwnerId::from("user-1"),
//! 	store,
//! 	push_channel,
//! 	Arc::new(ConnectionPool::default()),
//! 	Arc::new(ReadCache::default()),
//! 	SyncConfig::default(),
//! );
//!
//! engine.start().await?;
//!
//! let created = engine
//! 	.create(NewRecord::new(OwnerId::from("user-1"), Stage::Backlog).with_field("title", "Ship v2"))
//! 	.await?;
//!
//! engine.shutdown().await;
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod collection;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod persister;
pub mod pool;
pub mod reconciler;
pub mod reconnect;
pub mod record;
pub mod sanitize;
pub mod store;
pub mod suppression;
mod timer;
pub mod unsaved;

pub use collection::RecordCollection;
pub use config::SyncConfig;
pub use connection::{ChangeSink, ChangeStreamManager, ChannelStatus, PushChannel, Subscription};
pub use engine::{RecordEditor, SyncEngine};
pub use error::{Error, ValidationError};
pub use gateway::MutationGateway;
pub use ledger::{OptimisticEntry, OptimisticLedger, ReconcileReport};
pub use persister::{BatchedPersister, RecordUpdater, SaveState, SaveStatus};
pub use pool::ConnectionPool;
pub use reconciler::MessageReconciler;
pub use reconnect::{CircuitState, ReconnectDecision, ReconnectPolicy, Reconnector};
pub use record::{
	ChangeEvent, ChangeKind, NewRecord, OwnerId, Record, RecordId, RecordPatch, RecordRef, Stage,
	SubscriptionId,
};
pub use sanitize::Sanitizer;
pub use store::{fetch_with_retry, ReadCache, RemoteStore, StoreError};
pub use suppression::SuppressionRegistry;
pub use unsaved::UnsavedChanges;
