// src/error.rs
//! Error taxonomy for the datastore.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! one-to-one onto the failure kinds the public API documents; [`FeatherError::kind`]
//! exposes a stable discriminator string for callers that dispatch on it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeatherError>;

#[derive(Debug, Error)]
pub enum FeatherError {
    /// A document key uses a reserved character (`$` prefix or embedded `.`),
    /// or a document is structurally unusable (e.g. not a map at the top level).
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// Unknown operator, malformed operand, or a query value mixing operator
    /// keys with plain field keys.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Wrong modifier shape, unknown modifier, or a type mismatch while
    /// applying an update.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// A projection mixing inclusion and exclusion modes (outside of `_id`).
    #[error("invalid projection: {0}")]
    InvalidProjection(String),

    /// An update tried to change the `_id` of a stored document.
    #[error("cannot change the _id of a document")]
    ImmutableId,

    /// Two documents would share a key in a unique index.
    #[error("unique constraint violated for key {key} in index {index}")]
    UniqueViolated { key: String, index: String },

    /// A datafile line could not be decoded. Counted against the corruption
    /// threshold during load.
    #[error("malformed datafile line: {0}")]
    MalformedLine(String),

    /// Too many datafile lines were unreadable; the datastore refuses to
    /// operate on what remains.
    #[error(
        "datafile appears corrupted: {corrupt} of {total} lines unreadable \
         (threshold {threshold})"
    )]
    LoadCorrupted {
        corrupt: usize,
        total: usize,
        threshold: f64,
    },

    /// Underlying filesystem error, passed through unmodified.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FeatherError {
    /// Stable discriminator, independent of the human-readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            FeatherError::InvalidField(_) => "invalidField",
            FeatherError::InvalidQuery(_) => "invalidQuery",
            FeatherError::InvalidUpdate(_) => "invalidUpdate",
            FeatherError::InvalidProjection(_) => "invalidProjection",
            FeatherError::ImmutableId => "immutableId",
            FeatherError::UniqueViolated { .. } => "uniqueViolated",
            FeatherError::MalformedLine(_) => "malformedLine",
            FeatherError::LoadCorrupted { .. } => "loadCorrupted",
            FeatherError::Io(_) => "ioError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_discriminators() {
        assert_eq!(
            FeatherError::UniqueViolated {
                key: "\"hello\"".to_string(),
                index: "tf".to_string(),
            }
            .kind(),
            "uniqueViolated"
        );
        assert_eq!(FeatherError::ImmutableId.kind(), "immutableId");
        assert_eq!(
            FeatherError::InvalidQuery("boom".to_string()).kind(),
            "invalidQuery"
        );
    }

    #[test]
    fn test_unique_violated_message_names_index_and_key() {
        let err = FeatherError::UniqueViolated {
            key: "\"hello\"".to_string(),
            index: "tf".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("tf"));
        assert!(msg.contains("hello"));
    }

    #[test]
    fn test_io_error_passes_through() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: FeatherError = io.into();
        assert_eq!(err.kind(), "ioError");
        assert!(err.to_string().contains("nope"));
    }
}
