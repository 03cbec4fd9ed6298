//! Mover configuration
//!
//! Configuration loaded from environment variables and command line.

use crate::dispatcher::DispatcherConfig;
use crate::scheduler::SchedulerConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Mover configuration
#[derive(Debug, Clone)]
pub struct MoverConfig {
    /// Attempts per move before it is given up for this run
    pub max_retry_attempts: u32,

    /// Consecutive iterations without a successful move before the run stalls
    pub max_no_progress_iterations: u32,

    /// Concurrent moves per source node and per target node
    pub max_moves_per_node: usize,

    /// Concurrent moves per namespace
    pub max_concurrent_moves: usize,

    /// Moves scheduled per iteration; the rest wait for the next one
    pub max_moves_per_iteration: usize,

    /// Timeout for a single relocation attempt in seconds
    pub move_timeout_secs: u64,

    /// Delay before re-attempting a failed move in milliseconds
    pub retry_delay_ms: u64,

    /// Pause between iterations in milliseconds
    pub iteration_interval_ms: u64,

    /// Retries of a failed listing page before the namespace gives up
    pub listing_retries: u32,

    /// How often the run lease is renewed in milliseconds
    pub lease_renew_interval_ms: u64,

    /// Time in-flight moves get to finish after the lease is lost, in milliseconds
    pub lease_grace_period_ms: u64,

    /// Upper bound on iterations per namespace (0 = unbounded)
    pub max_iterations: u32,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 10,
            max_no_progress_iterations: 5,
            max_moves_per_node: 5,
            max_concurrent_moves: 64,
            max_moves_per_iteration: 10_000,
            move_timeout_secs: 300,
            retry_delay_ms: 1_000,
            iteration_interval_ms: 2_000,
            listing_retries: 3,
            lease_renew_interval_ms: 10_000,
            lease_grace_period_ms: 30_000,
            max_iterations: 0,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), value)),
        Err(_) => Ok(default),
    }
}

impl MoverConfig {
    /// Create configuration from `TIERMOVER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_retry_attempts: env_or(
                "TIERMOVER_RETRY_MAX_ATTEMPTS",
                defaults.max_retry_attempts,
            )?,
            max_no_progress_iterations: env_or(
                "TIERMOVER_MAX_NO_PROGRESS_ITERATIONS",
                defaults.max_no_progress_iterations,
            )?,
            max_moves_per_node: env_or(
                "TIERMOVER_MAX_MOVES_PER_NODE",
                defaults.max_moves_per_node,
            )?,
            max_concurrent_moves: env_or(
                "TIERMOVER_MAX_CONCURRENT_MOVES",
                defaults.max_concurrent_moves,
            )?,
            max_moves_per_iteration: env_or(
                "TIERMOVER_MAX_MOVES_PER_ITERATION",
                defaults.max_moves_per_iteration,
            )?,
            move_timeout_secs: env_or("TIERMOVER_MOVE_TIMEOUT", defaults.move_timeout_secs)?,
            retry_delay_ms: env_or("TIERMOVER_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            iteration_interval_ms: env_or(
                "TIERMOVER_ITERATION_INTERVAL_MS",
                defaults.iteration_interval_ms,
            )?,
            listing_retries: env_or("TIERMOVER_LISTING_RETRIES", defaults.listing_retries)?,
            lease_renew_interval_ms: env_or(
                "TIERMOVER_LEASE_RENEW_INTERVAL_MS",
                defaults.lease_renew_interval_ms,
            )?,
            lease_grace_period_ms: env_or(
                "TIERMOVER_LEASE_GRACE_PERIOD_MS",
                defaults.lease_grace_period_ms,
            )?,
            max_iterations: env_or("TIERMOVER_MAX_ITERATIONS", defaults.max_iterations)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the run loop meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_retry_attempts", self.max_retry_attempts as u64),
            (
                "max_no_progress_iterations",
                self.max_no_progress_iterations as u64,
            ),
            ("max_moves_per_node", self.max_moves_per_node as u64),
            ("max_concurrent_moves", self.max_concurrent_moves as u64),
            ("max_moves_per_iteration", self.max_moves_per_iteration as u64),
            ("lease_renew_interval_ms", self.lease_renew_interval_ms),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    name.to_string(),
                    "must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_secs(self.move_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn iteration_interval(&self) -> Duration {
        Duration::from_millis(self.iteration_interval_ms)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    pub fn lease_grace_period(&self) -> Duration {
        Duration::from_millis(self.lease_grace_period_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_moves_per_iteration: self.max_moves_per_iteration,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent_moves,
            max_per_source: self.max_moves_per_node,
            max_per_target: self.max_moves_per_node,
            move_timeout: self.move_timeout(),
            max_attempts: self.max_retry_attempts,
            retry_delay: self.retry_delay(),
        }
    }
}
