//! Error types for key-value operations.

/// Errors that can occur during key-value operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The backend could not serve the request.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// `atomic_add` was called on a key that does not hold a counter.
    #[error("value at {key} is not a counter")]
    NotACounter {
        /// The offending key, lossily decoded as UTF-8.
        key: String,
    },

    /// A persisted value is too short to carry its expiry header.
    #[error("corrupt value envelope at {key}")]
    CorruptEnvelope {
        /// The offending key, lossily decoded as UTF-8.
        key: String,
    },

    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    pub(crate) fn not_a_counter(key: &[u8]) -> Self {
        Self::NotACounter {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }
}
