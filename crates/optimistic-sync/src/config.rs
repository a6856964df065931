//! Sync engine configuration
//!
//! Every timing constant of the engine lives here so tests and embedders can tune them. Durations
//! are stored as milliseconds to keep the JSON form readable.

use crate::error::Error;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub reconnect: ReconnectConfig,
	pub pool: PoolConfig,
	pub suppression: SuppressionConfig,
	pub ledger: LedgerConfig,
	pub persister: PersisterConfig,
	pub reads: ReadConfig,
	pub validation: ValidationConfig,
}

impl SyncConfig {
	/// Load a config from JSON, missing sections fall back to their defaults
	pub fn from_json(json: &str) -> Result<Self, Error> {
		let config = serde_json::from_str::<Self>(json)?;
		config.validate()?;
		debug!(?config, "Loaded sync config");
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.pool.capacity == 0 {
			return Err(Error::InvalidConfig(
				"pool.capacity must be at least 1".to_string(),
			));
		}

		if self.reconnect.max_attempts == 0 {
			return Err(Error::InvalidConfig(
				"reconnect.max_attempts must be at least 1".to_string(),
			));
		}

		if self.pool.debounce_growth < 1.0 {
			return Err(Error::InvalidConfig(
				"pool.debounce_growth must be at least 1.0".to_string(),
			));
		}

		if self.reads.attempts == 0 {
			return Err(Error::InvalidConfig(
				"reads.attempts must be at least 1".to_string(),
			));
		}

		if self.ledger.sweep_interval_ms == 0 {
			return Err(Error::InvalidConfig(
				"ledger.sweep_interval_ms must be at least 1".to_string(),
			));
		}

		Ok(())
	}
}

/// Backoff and circuit breaker for (re)establishing the change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
	pub base_delay_ms: u64,
	pub max_delay_ms: u64,
	pub max_jitter_ms: u64,
	/// Consecutive failed attempts before the circuit opens
	pub max_attempts: u32,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			base_delay_ms: 1_000,
			max_delay_ms: 30_000,
			max_jitter_ms: 1_000,
			max_attempts: 5,
		}
	}
}

impl ReconnectConfig {
	#[must_use]
	pub const fn base_delay(&self) -> Duration {
		Duration::from_millis(self.base_delay_ms)
	}

	#[must_use]
	pub const fn max_delay(&self) -> Duration {
		Duration::from_millis(self.max_delay_ms)
	}
}

/// Limits on simultaneously open push subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
	pub capacity: usize,
	/// Delay before a connect deferred by a full pool is retried
	pub deferral_ms: u64,
	pub debounce_base_ms: u64,
	pub debounce_growth: f64,
	pub debounce_max_ms: u64,
	/// Delay before reconnecting after an established stream drops
	pub self_heal_delay_ms: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			capacity: 5,
			deferral_ms: 1_000,
			debounce_base_ms: 500,
			debounce_growth: 1.5,
			debounce_max_ms: 5_000,
			self_heal_delay_ms: 2_000,
		}
	}
}

impl PoolConfig {
	#[must_use]
	pub const fn deferral(&self) -> Duration {
		Duration::from_millis(self.deferral_ms)
	}

	#[must_use]
	pub const fn self_heal_delay(&self) -> Duration {
		Duration::from_millis(self.self_heal_delay_ms)
	}

	/// Minimum time between two connect attempts for the same owner, growing with the number of
	/// connections already open in the pool.
	#[must_use]
	pub fn connect_debounce(&self, active_connections: usize) -> Duration {
		let exponent = i32::try_from(active_connections.saturating_sub(1)).unwrap_or(i32::MAX);

		#[allow(clippy::cast_precision_loss)]
		let millis = (self.debounce_base_ms as f64) * self.debounce_growth.powi(exponent);

		#[allow(clippy::cast_precision_loss)]
		let capped = millis.min(self.debounce_max_ms as f64);

		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
		let millis = capped.round() as u64;

		Duration::from_millis(millis)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionConfig {
	/// Mute window installed by the mutation gateway before every remote write
	pub gateway_ms: u64,
	/// Mute window installed by the batched persister before it flushes
	pub persister_ms: u64,
}

impl Default for SuppressionConfig {
	fn default() -> Self {
		Self {
			gateway_ms: 8_000,
			persister_ms: 5_000,
		}
	}
}

impl SuppressionConfig {
	#[must_use]
	pub const fn gateway(&self) -> Duration {
		Duration::from_millis(self.gateway_ms)
	}

	#[must_use]
	pub const fn persister(&self) -> Duration {
		Duration::from_millis(self.persister_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
	pub confirm_timeout_ms: u64,
	pub sweep_interval_ms: u64,
	pub sweep_max_age_ms: u64,
}

impl Default for LedgerConfig {
	fn default() -> Self {
		Self {
			confirm_timeout_ms: 10_000,
			sweep_interval_ms: 3_000,
			sweep_max_age_ms: 12_000,
		}
	}
}

impl LedgerConfig {
	#[must_use]
	pub const fn confirm_timeout(&self) -> Duration {
		Duration::from_millis(self.confirm_timeout_ms)
	}

	#[must_use]
	pub const fn sweep_interval(&self) -> Duration {
		Duration::from_millis(self.sweep_interval_ms)
	}

	#[must_use]
	pub const fn sweep_max_age(&self) -> Duration {
		Duration::from_millis(self.sweep_max_age_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersisterConfig {
	pub idle_ms: u64,
	pub saved_display_ms: u64,
	pub error_display_ms: u64,
}

impl Default for PersisterConfig {
	fn default() -> Self {
		Self {
			idle_ms: 1_000,
			saved_display_ms: 2_000,
			error_display_ms: 5_000,
		}
	}
}

impl PersisterConfig {
	#[must_use]
	pub const fn idle(&self) -> Duration {
		Duration::from_millis(self.idle_ms)
	}

	#[must_use]
	pub const fn saved_display(&self) -> Duration {
		Duration::from_millis(self.saved_display_ms)
	}

	#[must_use]
	pub const fn error_display(&self) -> Duration {
		Duration::from_millis(self.error_display_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
	pub attempts: u32,
	pub base_delay_ms: u64,
	pub cache_ttl_ms: u64,
}

impl Default for ReadConfig {
	fn default() -> Self {
		Self {
			attempts: 3,
			base_delay_ms: 1_000,
			cache_ttl_ms: 30_000,
		}
	}
}

impl ReadConfig {
	#[must_use]
	pub const fn base_delay(&self) -> Duration {
		Duration::from_millis(self.base_delay_ms)
	}

	#[must_use]
	pub const fn cache_ttl(&self) -> Duration {
		Duration::from_millis(self.cache_ttl_ms)
	}
}

/// Free-text rules applied by the mutation gateway before any write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
	pub text_fields: Vec<TextFieldRule>,
}

impl Default for ValidationConfig {
	fn default() -> Self {
		Self {
			text_fields: vec![
				TextFieldRule {
					field: "title".to_string(),
					required: true,
					min_len: 1,
					max_len: 200,
					truncate: false,
				},
				TextFieldRule {
					field: "description".to_string(),
					required: false,
					min_len: 0,
					max_len: 5_000,
					truncate: true,
				},
			],
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFieldRule {
	pub field: String,
	#[serde(default)]
	pub required: bool,
	#[serde(default)]
	pub min_len: usize,
	pub max_len: usize,
	/// Cut over-long values down to `max_len` instead of rejecting them
	#[serde(default)]
	pub truncate: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_engine_constants() {
		let config = SyncConfig::default();

		assert_eq!(config.reconnect.max_attempts, 5);
		assert_eq!(config.pool.capacity, 5);
		assert_eq!(config.suppression.gateway(), Duration::from_secs(8));
		assert_eq!(config.ledger.confirm_timeout(), Duration::from_secs(10));
		assert_eq!(config.persister.idle(), Duration::from_secs(1));
		assert_eq!(config.reads.cache_ttl(), Duration::from_secs(30));
	}

	#[test]
	fn partial_json_keeps_other_defaults() {
		let config = SyncConfig::from_json(r#"{ "pool": { "capacity": 2 } }"#).unwrap();

		assert_eq!(config.pool.capacity, 2);
		assert_eq!(config.pool.debounce_base_ms, 500);
		assert_eq!(config.reconnect, ReconnectConfig::default());
	}

	#[test]
	fn rejects_empty_pool() {
		assert!(matches!(
			SyncConfig::from_json(r#"{ "pool": { "capacity": 0 } }"#),
			Err(Error::InvalidConfig(_))
		));
		assert!(matches!(
			SyncConfig::from_json("{ not json"),
			Err(Error::Config(_))
		));
	}

	#[test]
	fn rejects_zero_sweep_interval() {
		assert!(matches!(
			SyncConfig::from_json(r#"{ "ledger": { "sweep_interval_ms": 0 } }"#),
			Err(Error::InvalidConfig(_))
		));
		assert!(SyncConfig::from_json(r#"{ "ledger": { "sweep_interval_ms": 1 } }"#).is_ok());
	}

	#[test]
	fn connect_debounce_grows_and_caps() {
		let pool = PoolConfig::default();

		assert_eq!(pool.connect_debounce(0), Duration::from_millis(500));
		assert_eq!(pool.connect_debounce(1), Duration::from_millis(500));
		assert_eq!(pool.connect_debounce(2), Duration::from_millis(750));
		assert_eq!(pool.connect_debounce(3), Duration::from_millis(1_125));
		assert_eq!(pool.connect_debounce(20), Duration::from_millis(5_000));
	}
}
