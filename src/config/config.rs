//! Queue runtime configuration.

use std::str::FromStr;

use anyerror::AnyError;
use clap::Parser;

use crate::config::error::ConfigError;

/// Parse number with unit such as 5.3 KB
fn parse_bytes_with_unit(src: &str) -> Result<u64, ConfigError> {
    let res = byte_unit::Byte::from_str(src).map_err(|e| ConfigError::InvalidNumber {
        invalid: src.to_string(),
        reason: e.to_string(),
    })?;

    Ok(res.as_u64())
}

/// Runtime configuration for a leader message queue.
///
/// `Config` controls the per-queue and process-wide entry cache budgets, the
/// outgoing batch size cap, and diagnostics.
///
/// # Usage
///
/// Create a configuration, optionally customize fields, validate it, and
/// pass it to [`PeerMessageQueue::new`](crate::PeerMessageQueue::new):
///
/// ```ignore
/// use consensus_queue::Config;
///
/// let config = Config {
///     entry_cache_soft_limit: 64 * 1024 * 1024,
///     ..Default::default()
/// };
/// let config = config.validate()?;
/// ```
#[derive(Clone, Debug, Parser)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Config {
    /// The id under which the process-wide parent memory tracker is
    /// registered. Queues sharing this id share the global budget.
    #[clap(long, default_value = "consensus_queue_parent")]
    pub parent_tracker_id: String,

    /// The per-queue size of entries to keep in memory. This is a soft
    /// limit: entries are discarded down to it only when no peer still
    /// needs them.
    #[clap(long, default_value = "128MiB", value_parser=parse_bytes_with_unit)]
    pub entry_cache_soft_limit: u64,

    /// The per-queue hard limit on entries kept in memory. A REPLICATE
    /// append that would exceed it is rejected.
    #[clap(long, default_value = "256MiB", value_parser=parse_bytes_with_unit)]
    pub entry_cache_hard_limit: u64,

    /// Process-wide version of `entry_cache_soft_limit`, shared by all
    /// queues registered under the same parent tracker id.
    #[clap(long, default_value = "1GiB", value_parser=parse_bytes_with_unit)]
    pub global_entry_cache_soft_limit: u64,

    /// Process-wide version of `entry_cache_hard_limit`.
    #[clap(long, default_value = "1GiB", value_parser=parse_bytes_with_unit)]
    pub global_entry_cache_hard_limit: u64,

    /// The soft cap on the byte size of a single outgoing batch. A batch
    /// holding exactly one operation may exceed it.
    #[clap(long, default_value = "1MiB", value_parser=parse_bytes_with_unit)]
    pub max_batch_bytes: u64,

    /// Whether to dump the full contents of the queue to the log when an
    /// append is rejected. Mostly useful for debugging.
    // clap 4 requires `num_args = 0..=1`, or it complains about missing arg error
    // https://github.com/clap-rs/clap/discussions/4374
    #[clap(long,
           default_value_t = false,
           action = clap::ArgAction::Set,
           num_args = 0..=1,
           default_missing_value = "true"
    )]
    pub dump_queue_on_full: bool,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// Build a `Config` instance from a series of command line arguments.
    ///
    /// The first element in `args` must be the application name.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::try_parse_from(args).map_err(|e| ConfigError::ParseError {
            source: AnyError::from(&e),
            args: args.iter().map(|x| x.to_string()).collect(),
        })?;
        config.validate()
    }

    /// Validate the state of this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.entry_cache_soft_limit > self.entry_cache_hard_limit {
            return Err(ConfigError::SoftExceedsHard {
                name: "entry_cache".to_string(),
                soft: self.entry_cache_soft_limit,
                hard: self.entry_cache_hard_limit,
            });
        }

        if self.global_entry_cache_soft_limit > self.global_entry_cache_hard_limit {
            return Err(ConfigError::SoftExceedsHard {
                name: "global_entry_cache".to_string(),
                soft: self.global_entry_cache_soft_limit,
                hard: self.global_entry_cache_hard_limit,
            });
        }

        if self.max_batch_bytes == 0 {
            return Err(ConfigError::MaxBatchIs0);
        }

        Ok(self)
    }
}
