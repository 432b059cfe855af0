use thiserror::Error;

/// Nonce keeper errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NonceError {
    /// Storage or registry cannot be reached, written, or has been closed
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Write would reuse or lower below a nonce that is already in flight
    #[error("Stale write rejected for {key}: attempted next nonce {attempted}, highest committed nonce {floor}")]
    StaleWrite {
        key: String,
        attempted: u64,
        floor: u64,
    },

    /// Remote and local state disagree in a way the reclaim policy cannot resolve
    #[error("Reconciliation conflict for {key}: {detail}")]
    ReconciliationConflict { key: String, detail: String },

    /// Remote oracle call exceeded its deadline
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Remote oracle returned an error
    #[error("Oracle error: {message} (endpoint: {endpoint:?})")]
    Oracle {
        endpoint: Option<String>,
        message: String,
    },

    /// Address could not be parsed as a 20-byte EVM address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No transaction entry exists for this nonce
    #[error("No transaction entry for {key} nonce {nonce}")]
    UnknownEntry { key: String, nonce: u64 },

    /// Requested status change is not allowed from the entry's current status
    #[error("Cannot move {key} nonce {nonce} from {from} to {to}")]
    InvalidTransition {
        key: String,
        nonce: u64,
        from: String,
        to: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NonceError {
    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        match self {
            NonceError::ResourceUnavailable(_) => true,
            NonceError::Timeout(_) => true,
            NonceError::Oracle { .. } => true,

            NonceError::StaleWrite { .. } => false,
            NonceError::ReconciliationConflict { .. } => false,
            NonceError::InvalidAddress(_) => false,
            NonceError::UnknownEntry { .. } => false,
            NonceError::InvalidTransition { .. } => false,
            NonceError::Configuration(_) => false,
            NonceError::Internal(_) => false,
        }
    }

    pub fn oracle(endpoint: Option<&str>, message: impl Into<String>) -> Self {
        NonceError::Oracle {
            endpoint: endpoint.map(str::to_string),
            message: message.into(),
        }
    }
}

impl From<sled::Error> for NonceError {
    fn from(err: sled::Error) -> Self {
        NonceError::ResourceUnavailable(err.to_string())
    }
}

impl From<bincode::Error> for NonceError {
    fn from(err: bincode::Error) -> Self {
        NonceError::ResourceUnavailable(format!("corrupt record: {}", err))
    }
}

/// Result type for nonce operations
pub type NonceResult<T> = Result<T, NonceError>;
