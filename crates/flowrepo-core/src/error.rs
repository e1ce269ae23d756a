//! Error types shared by the flowrepo subsystems.

use thiserror::Error;

/// Errors raised while framing or unframing persisted records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value could not be serialized.
    #[error("Encode error: {0}")]
    Encode(String),

    /// A checksummed payload could not be deserialized.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Invalid config file {path}: {reason}")]
    Parse {
        /// The offending file.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// The file extension is neither `toml` nor `json`.
    #[error("Unsupported config file extension: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}
