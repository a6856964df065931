//! Backoff and circuit breaker for the change stream
//!
//! [`ReconnectPolicy`] is a pure state machine, [`Reconnector`] drives it with a cancellable timer.
//!
//! ```text
//! Closed(n) --failure, n < max--> Closed(n + 1)   (retry scheduled)
//! Closed(max) --failure--------> Open             (nothing scheduled)
//! Open --manual retry----------> Closed(0)
//! any --success----------------> Closed(0)
//! ```

use crate::{config::ReconnectConfig, timer::Timer};

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed { attempts: u32 },
	Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
	Retry { attempt: u32, delay: Duration },
	CircuitOpen,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
	config: ReconnectConfig,
	state: CircuitState,
}

impl ReconnectPolicy {
	#[must_use]
	pub const fn new(config: ReconnectConfig) -> Self {
		Self {
			config,
			state: CircuitState::Closed { attempts: 0 },
		}
	}

	#[must_use]
	pub const fn state(&self) -> CircuitState {
		self.state
	}

	#[must_use]
	pub const fn attempts(&self) -> u32 {
		match self.state {
			CircuitState::Closed { attempts } => attempts,
			CircuitState::Open => self.config.max_attempts,
		}
	}

	#[must_use]
	pub const fn is_circuit_open(&self) -> bool {
		matches!(self.state, CircuitState::Open)
	}

	/// Delay before the given attempt (1-based) without jitter, capped at the max delay
	#[must_use]
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(20);

		self.config
			.base_delay()
			.saturating_mul(1 << exponent)
			.min(self.config.max_delay())
	}

	/// Record a failed or lost connection and decide whether to try again
	pub fn on_failure(&mut self, jitter: Duration) -> ReconnectDecision {
		match self.state {
			CircuitState::Open => ReconnectDecision::CircuitOpen,

			CircuitState::Closed { attempts } if attempts >= self.config.max_attempts => {
				self.state = CircuitState::Open;
				ReconnectDecision::CircuitOpen
			}

			CircuitState::Closed { attempts } => {
				let attempt = attempts + 1;
				self.state = CircuitState::Closed { attempts: attempt };

				ReconnectDecision::Retry {
					attempt,
					delay: (self.base_delay(attempt) + jitter).min(self.config.max_delay()),
				}
			}
		}
	}

	/// Closes the circuit whatever its prior state
	pub fn manual_retry(&mut self) {
		self.state = CircuitState::Closed { attempts: 0 };
	}

	pub fn reset_on_success(&mut self) {
		self.state = CircuitState::Closed { attempts: 0 };
	}
}

fn jitter(max_jitter_ms: u64) -> Duration {
	Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
}

/// Schedules reconnect attempts according to a [`ReconnectPolicy`]
#[derive(Debug)]
pub struct Reconnector {
	policy: Mutex<ReconnectPolicy>,
	pending: Mutex<Option<Timer>>,
	max_jitter_ms: u64,
	cancel: CancellationToken,
}

impl Reconnector {
	#[must_use]
	pub fn new(config: ReconnectConfig, cancel: CancellationToken) -> Self {
		Self {
			max_jitter_ms: config.max_jitter_ms,
			policy: Mutex::new(ReconnectPolicy::new(config)),
			pending: Mutex::new(None),
			cancel,
		}
	}

	/// Count a failure and, unless the circuit is open, run `attempt` after the backoff delay.
	/// A newer schedule replaces any attempt still waiting.
	pub async fn schedule_reconnect<F>(&self, attempt: F) -> ReconnectDecision
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let decision = self
			.policy
			.lock()
			.await
			.on_failure(jitter(self.max_jitter_ms));

		match decision {
			ReconnectDecision::Retry { attempt: n, delay } => {
				debug!(attempt = n, delay_ms = delay.as_millis(), "Scheduling reconnect");
				*self.pending.lock().await = Some(Timer::schedule(delay, &self.cancel, attempt));
			}
			ReconnectDecision::CircuitOpen => {
				warn!("Reconnect circuit open, waiting for a manual retry");
				self.pending.lock().await.take();
			}
		}

		decision
	}

	/// Close the circuit, drop any scheduled attempt and try right away
	pub async fn manual_retry<F: Future>(&self, attempt: F) -> F::Output {
		self.pending.lock().await.take();
		self.policy.lock().await.manual_retry();
		info!("Manual reconnect requested");

		attempt.await
	}

	pub async fn reset_on_success(&self) {
		self.policy.lock().await.reset_on_success();
	}

	pub async fn is_circuit_open(&self) -> bool {
		self.policy.lock().await.is_circuit_open()
	}

	pub async fn attempts(&self) -> u32 {
		self.policy.lock().await.attempts()
	}

	pub async fn cancel_pending(&self) {
		self.pending.lock().await.take();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	};

	use tokio::time::sleep;

	#[test]
	fn backoff_is_monotonic_and_capped_until_circuit_opens() {
		let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
		let mut previous_base = Duration::ZERO;

		for expected_attempt in 1..=5 {
			let ReconnectDecision::Retry { attempt, delay } =
				policy.on_failure(Duration::from_millis(999))
			else {
				panic!("circuit opened too early");
			};

			let base = policy.base_delay(attempt);
			assert_eq!(attempt, expected_attempt);
			assert!(base >= previous_base);
			assert!(delay >= base);
			assert!(delay <= Duration::from_secs(30));
			previous_base = base;
		}

		assert_eq!(
			policy.on_failure(Duration::ZERO),
			ReconnectDecision::CircuitOpen
		);
		assert!(policy.is_circuit_open());
		assert_eq!(
			policy.on_failure(Duration::ZERO),
			ReconnectDecision::CircuitOpen
		);
	}

	#[test]
	fn delay_never_exceeds_cap() {
		let mut policy = ReconnectPolicy::new(ReconnectConfig {
			max_attempts: 10,
			..Default::default()
		});

		for _ in 0..10 {
			if let ReconnectDecision::Retry { delay, .. } =
				policy.on_failure(Duration::from_millis(1_000))
			{
				assert!(delay <= Duration::from_secs(30));
			}
		}

		assert_eq!(policy.base_delay(10), Duration::from_secs(30));
	}

	#[test]
	fn manual_retry_and_success_close_the_circuit() {
		let mut policy = ReconnectPolicy::new(ReconnectConfig {
			max_attempts: 1,
			..Default::default()
		});

		policy.on_failure(Duration::ZERO);
		policy.on_failure(Duration::ZERO);
		assert!(policy.is_circuit_open());

		policy.manual_retry();
		assert_eq!(policy.state(), CircuitState::Closed { attempts: 0 });

		policy.on_failure(Duration::ZERO);
		assert_eq!(policy.attempts(), 1);

		policy.reset_on_success();
		assert_eq!(policy.state(), CircuitState::Closed { attempts: 0 });
	}

	#[tokio::test(start_paused = true)]
	async fn reconnector_runs_attempts_until_circuit_opens() {
		let reconnector = Reconnector::new(ReconnectConfig::default(), CancellationToken::new());
		let runs = Arc::new(AtomicU32::new(0));

		for _ in 0..5 {
			let decision = reconnector
				.schedule_reconnect({
					let runs = Arc::clone(&runs);
					async move {
						runs.fetch_add(1, Ordering::SeqCst);
					}
				})
				.await;
			assert!(matches!(decision, ReconnectDecision::Retry { .. }));

			sleep(Duration::from_secs(31)).await;
		}

		assert_eq!(runs.load(Ordering::SeqCst), 5);

		let decision = reconnector
			.schedule_reconnect({
				let runs = Arc::clone(&runs);
				async move {
					runs.fetch_add(1, Ordering::SeqCst);
				}
			})
			.await;
		assert_eq!(decision, ReconnectDecision::CircuitOpen);
		assert!(reconnector.is_circuit_open().await);

		sleep(Duration::from_secs(60)).await;
		assert_eq!(runs.load(Ordering::SeqCst), 5);

		reconnector
			.manual_retry(async {
				runs.fetch_add(1, Ordering::SeqCst);
			})
			.await;
		assert_eq!(runs.load(Ordering::SeqCst), 6);
		assert!(!reconnector.is_circuit_open().await);
		assert_eq!(reconnector.attempts().await, 0);
	}
}
