use thiserror::Error;

/// Errors raised by the fee decision engine.
///
/// `Configuration` aborts a run before any channel is evaluated. The other
/// variants are per-channel and are collected next to the successful
/// decisions instead of aborting the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeeError {
    #[error("Configuration error: {field} {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("Invalid input for channel {channel_id}: {field} = {value} is outside [-1, 1]")]
    InvalidInput {
        channel_id: String,
        field: &'static str,
        value: f64,
    },

    #[error("No current fee policy for channel {channel_id} (channel point {channel_point})")]
    MissingPolicy {
        channel_id: String,
        channel_point: String,
    },
}

pub type FeeResult<T> = Result<T, FeeError>;
