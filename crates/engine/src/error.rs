//! Error types for host module attach

/// Error type for attach operations
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    /// Host module is not loaded in this process yet (retryable)
    #[error("Host module not loaded: {0}")]
    HostNotLoaded(String),

    /// Host module is loaded but does not export a required symbol
    #[error("Symbol not exported by host: {0}")]
    MissingSymbol(String),

    /// Symbol or module name is not a valid C string
    #[error("Invalid symbol name: {0}")]
    InvalidSymbolName(String),
}

impl AttachError {
    /// Whether polling again later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttachError::HostNotLoaded(_))
    }
}
