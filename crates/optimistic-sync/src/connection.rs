//! Change stream connection manager
//!
//! Owns the lifecycle of the push subscription for one owner. Subscriptions are expensive, so
//! every manager draws from a shared [`ConnectionPool`] and connect attempts are debounced by how
//! busy the pool already is.
//!
//! Two independent retry paths exist:
//! - attempts that fail before the stream ever reports [`ChannelStatus::Subscribed`] go through
//!   the [`Reconnector`] backoff and circuit breaker;
//! - an established stream that later drops heals itself after a fixed short delay.

use crate::{
	config::{PoolConfig, ReconnectConfig},
	error::Error,
	pool::ConnectionPool,
	reconnect::Reconnector,
	record::{ChangeEvent, OwnerId, SubscriptionId},
	timer::Timer,
};

use std::sync::Arc;

use async_channel as chan;
use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use tokio::{
	spawn,
	sync::{watch, Mutex},
	time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
	Subscribed,
	Error(String),
	TimedOut,
	Closed,
}

/// Receiving ends of one push subscription
#[derive(Debug)]
pub struct Subscription {
	pub events: chan::Receiver<ChangeEvent>,
	pub status: chan::Receiver<ChannelStatus>,
}

/// Transport able to stream record changes filtered by owner
#[async_trait]
pub trait PushChannel: Send + Sync + 'static {
	async fn subscribe(&self, owner: &OwnerId, id: SubscriptionId)
		-> Result<Subscription, Error>;

	async fn unsubscribe(&self, id: SubscriptionId);
}

/// Receives the raw events of a subscription, in order
#[async_trait]
pub trait ChangeSink: Send + Sync + 'static {
	async fn on_change(&self, event: ChangeEvent);
}

struct ActiveSubscription {
	id: SubscriptionId,
	stop: CancellationToken,
	established: bool,
}

#[derive(Default)]
struct ConnectionState {
	owner: Option<OwnerId>,
	sink: Option<Arc<dyn ChangeSink>>,
	active: Option<ActiveSubscription>,
	connecting: bool,
	last_attempt_at: Option<Instant>,
	deferred: Option<Timer>,
	self_heal: Option<Timer>,
}

struct Inner {
	channel: Arc<dyn PushChannel>,
	pool: Arc<ConnectionPool>,
	config: PoolConfig,
	reconnector: Reconnector,
	state: Mutex<ConnectionState>,
	connected_tx: watch::Sender<bool>,
	cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ChangeStreamManager {
	inner: Arc<Inner>,
}

impl ChangeStreamManager {
	#[must_use]
	pub fn new(
		channel: Arc<dyn PushChannel>,
		pool: Arc<ConnectionPool>,
		pool_config: PoolConfig,
		reconnect_config: ReconnectConfig,
		cancel: CancellationToken,
	) -> Self {
		let (connected_tx, _) = watch::channel(false);

		Self {
			inner: Arc::new(Inner {
				channel,
				pool,
				config: pool_config,
				reconnector: Reconnector::new(reconnect_config, cancel.clone()),
				state: Mutex::new(ConnectionState::default()),
				connected_tx,
				cancel,
			}),
		}
	}

	/// Subscribe to changes for `owner`, tearing down whatever this manager held before
	#[instrument(skip(self, sink), fields(%owner))]
	pub async fn connect(&self, owner: OwnerId, sink: Arc<dyn ChangeSink>) {
		if self.inner.cancel.is_cancelled() {
			debug!("Connect requested after shutdown, ignoring");
			return;
		}

		let previous = {
			let mut state = self.inner.state.lock().await;

			state.deferred = None;
			state.self_heal = None;
			state.sink = Some(sink);

			// debounce is tracked per owner
			if state
				.owner
				.replace(owner.clone())
				.is_some_and(|previous| previous != owner)
			{
				state.last_attempt_at = None;
			}

			state.active.take()
		};

		self.inner.teardown(previous).await;

		Arc::clone(&self.inner).attempt().await;
	}

	#[instrument(skip(self))]
	pub async fn disconnect(&self) {
		self.inner.reconnector.cancel_pending().await;

		let (active, owner) = {
			let mut state = self.inner.state.lock().await;

			state.deferred = None;
			state.self_heal = None;
			state.sink = None;
			state.connecting = false;

			(state.active.take(), state.owner.take())
		};

		self.inner.teardown(active).await;

		if let Some(owner) = owner {
			info!(%owner, "Change stream disconnected");
		}
	}

	/// Reset the backoff and try to connect again, the only way out of an open circuit
	pub async fn retry_connection(&self) {
		let attempt = Arc::clone(&self.inner).attempt();
		self.inner.reconnector.manual_retry(attempt).await;
	}

	/// Cancel every timer and the stream pump, then release the subscription and pool slot
	pub async fn shutdown(&self) {
		self.inner.cancel.cancel();
		self.disconnect().await;
	}

	#[must_use]
	pub fn is_connected(&self) -> bool {
		*self.inner.connected_tx.borrow()
	}

	#[must_use]
	pub fn watch_connected(&self) -> watch::Receiver<bool> {
		self.inner.connected_tx.subscribe()
	}

	pub async fn is_circuit_open(&self) -> bool {
		self.inner.reconnector.is_circuit_open().await
	}

	pub async fn reconnect_attempts(&self) -> u32 {
		self.inner.reconnector.attempts().await
	}
}

impl Inner {
	/// Boxed so timers can schedule another attempt from inside an attempt
	fn attempt(self: Arc<Self>) -> BoxFuture<'static, ()> {
		async move {
			if self.cancel.is_cancelled() {
				return;
			}

			let mut state = self.state.lock().await;

			let (Some(owner), Some(sink)) = (state.owner.clone(), state.sink.clone()) else {
				trace!("No owner to connect for");
				return;
			};

			if state.connecting || state.active.is_some() {
				trace!(%owner, "Change stream already open or opening");
				return;
			}

			let min_interval = self.config.connect_debounce(self.pool.active_count().await);
			if let Some(elapsed) = state.last_attempt_at.map(|at| at.elapsed()) {
				if elapsed < min_interval {
					let wait = min_interval - elapsed;
					debug!(%owner, wait_ms = wait.as_millis(), "Debouncing connect attempt");
					state.deferred = Some(Timer::schedule(
						wait,
						&self.cancel,
						Arc::clone(&self).attempt(),
					));
					return;
				}
			}

			let id = Uuid::new_v4();

			if !self.pool.try_acquire(&owner, id).await {
				debug!(
					%owner,
					capacity = self.pool.capacity(),
					"Connection pool full, deferring connect"
				);
				state.deferred = Some(Timer::schedule(
					self.config.deferral(),
					&self.cancel,
					Arc::clone(&self).attempt(),
				));
				return;
			}

			state.deferred = None;
			state.connecting = true;
			state.last_attempt_at = Some(Instant::now());

			debug!(%owner, subscription_id = %id, "Opening change stream");

			match self.channel.subscribe(&owner, id).await {
				Ok(subscription) => {
					let stop = self.cancel.child_token();

					state.connecting = false;
					state.active = Some(ActiveSubscription {
						id,
						stop: stop.clone(),
						established: false,
					});
					drop(state);

					spawn(Arc::clone(&self).pump(id, sink, subscription, stop));
				}
				Err(e) => {
					state.connecting = false;
					drop(state);

					self.pool.release(id).await;
					warn!(%owner, ?e, "Failed to open change stream");
					self.schedule_retry().await;
				}
			}
		}
		.boxed()
	}

	async fn schedule_retry(self: &Arc<Self>) {
		let attempt = Arc::clone(self).attempt();
		self.reconnector.schedule_reconnect(attempt).await;
	}

	async fn pump(
		self: Arc<Self>,
		id: SubscriptionId,
		sink: Arc<dyn ChangeSink>,
		subscription: Subscription,
		stop: CancellationToken,
	) {
		let Subscription {
			events: events_rx,
			status: status_rx,
		} = subscription;

		loop {
			tokio::select! {
				biased;

				() = stop.cancelled() => break,

				status = status_rx.recv() => {
					if !self.on_status(id, status.unwrap_or(ChannelStatus::Closed)).await {
						break;
					}
				}

				event = events_rx.recv() => match event {
					Ok(event) => sink.on_change(event).await,
					Err(chan::RecvError) => {
						self.on_status(id, ChannelStatus::Closed).await;
						break;
					}
				},
			}
		}

		trace!(subscription_id = %id, "Change stream pump stopped");
	}

	/// Returns whether the pump should keep running
	async fn on_status(self: &Arc<Self>, id: SubscriptionId, status: ChannelStatus) -> bool {
		let mut state = self.state.lock().await;

		let Some(active) = state.active.as_mut().filter(|active| active.id == id) else {
			trace!(subscription_id = %id, ?status, "Status for a stale subscription");
			return false;
		};

		if status == ChannelStatus::Subscribed {
			active.established = true;
			drop(state);

			self.connected_tx.send_replace(true);
			self.reconnector.reset_on_success().await;
			info!(subscription_id = %id, "Change stream connected");

			return true;
		}

		let was_established = active.established;
		let lost = state.active.take();

		if was_established {
			warn!(subscription_id = %id, ?status, "Change stream dropped, healing");
			state.self_heal = Some(Timer::schedule(
				self.config.self_heal_delay(),
				&self.cancel,
				Arc::clone(self).attempt(),
			));
		}
		drop(state);

		self.connected_tx.send_replace(false);
		self.teardown(lost).await;

		if !was_established {
			warn!(subscription_id = %id, ?status, "Change stream failed to subscribe");
			self.schedule_retry().await;
		}

		false
	}

	/// Stop the pump, unsubscribe and give the pool slot back
	async fn teardown(&self, active: Option<ActiveSubscription>) {
		if let Some(ActiveSubscription { id, stop, .. }) = active {
			stop.cancel();
			self.connected_tx.send_replace(false);
			self.channel.unsubscribe(id).await;
			self.pool.release(id).await;
			trace!(subscription_id = %id, "Change stream torn down");
		}
	}
}
