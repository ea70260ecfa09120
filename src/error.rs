use thiserror::Error;

/// Main error type for the grid engine
#[derive(Error, Debug)]
pub enum GridError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Insufficient balance to open a position on {instrument}")]
    InsufficientBalance { instrument: String },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Signal errors
    #[error("Unknown signal function: {0}")]
    UnknownSignal(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for GridError
pub type Result<T> = std::result::Result<T, GridError>;

/// Specific error types for order execution
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Order {order_id} rejected: {reason}")]
    Rejected { order_id: String, reason: String },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32 },
}

impl From<OrderError> for GridError {
    fn from(err: OrderError) -> Self {
        GridError::OrderSubmission(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_error_maps_to_submission_failure() {
        let err: GridError = OrderError::MaxRetriesExceeded { attempts: 4 }.into();
        assert!(matches!(err, GridError::OrderSubmission(_)));
        assert!(err.to_string().contains("Max retries exceeded: 4"));
    }
}
