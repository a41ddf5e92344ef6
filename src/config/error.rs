use anyerror::AnyError;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse configuration from command-line arguments.
    #[error("ParseError: {source} while parsing ({args:?})")]
    ParseError {
        /// The underlying parse error.
        source: AnyError,
        /// The arguments that failed to parse.
        args: Vec<String>,
    },

    /// A soft limit is larger than its hard limit.
    #[error("{name}: soft limit ({soft}) must be <= hard limit ({hard})")]
    SoftExceedsHard {
        /// Which budget pair is inconsistent.
        name: String,
        /// The soft limit in bytes.
        soft: u64,
        /// The hard limit in bytes.
        hard: u64,
    },

    /// The `max_batch_bytes` configuration must be greater than 0.
    #[error("max_batch_bytes must be > 0")]
    MaxBatchIs0,

    /// Failed to parse a number from string.
    #[error("{reason} when parsing {invalid:?}")]
    InvalidNumber {
        /// The invalid number string.
        invalid: String,
        /// The reason for the parse failure.
        reason: String,
    },
}
