//! Error types for the Cavern service binary.

/// Top-level error for the service binary.
///
/// Each variant wraps a subsystem error so `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cavern_core::ConfigError,
    },

    /// Engine startup or an administrative operation failed.
    #[error("engine error: {source}")]
    Engine {
        /// The underlying engine error.
        #[from]
        source: cavern_core::EngineError,
    },

    /// Connecting to or migrating a store failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: cavern_db::DbError,
    },

    /// Reading the replay stream failed.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The maintenance task panicked.
    #[error("maintenance task failed: {source}")]
    Maintenance {
        /// The join error from tokio.
        #[from]
        source: tokio::task::JoinError,
    },
}
