// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-abliterate.

/// Errors that can occur while caching, editing, or scoring a model.
#[derive(Debug, thiserror::Error)]
pub enum AbliterationError {
    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Tensor shapes that cannot be combined (direction width, matrix width).
    #[error("shape error: {0}")]
    Shape(String),

    /// An operation needs state that has not been built yet
    /// (e.g. directions requested before any activation cache exists).
    #[error("state error: {0}")]
    State(String),

    /// A layer beyond `n_layers`, or a site absent from the current cache.
    #[error("index error: {0}")]
    Index(String),

    /// Reducer name outside the supported set.
    #[error("unknown reducer `{name}`; valid reducers: {valid}")]
    UnknownReducer {
        /// The rejected name.
        name: String,
        /// Comma-separated list of accepted names.
        valid: String,
    },

    /// Session configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Malformed persisted session bundle.
    #[error("bundle error: {0}")]
    Bundle(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-abliterate operations.
pub type Result<T> = std::result::Result<T, AbliterationError>;
