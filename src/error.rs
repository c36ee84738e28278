use std::path::PathBuf;

use thiserror::Error;

use crate::digest::Digest;
use crate::registry::StoreError;

pub type Result<T, E = PushError> = std::result::Result<T, E>;

/// Every way a push can fail. Nothing here is retried; the first error aborts
/// the remaining stages.
#[derive(Error, Debug)]
pub enum PushError {
    /// The container runtime could not export the image.
    #[error("export of {image} failed: {message}")]
    Export { image: String, message: String },

    /// The exported archive was malformed or could not be written to disk.
    #[error("extraction into {} failed: {message}", path.display())]
    Extraction {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("repository index not found at {}", path.display())]
    MissingIndex { path: PathBuf },

    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A repository, tag or layer id could not be resolved inside the bundle.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("layer ancestry starting at {leaf} exceeds {limit} layers or loops back on {repeated}")]
    Cycle {
        leaf: String,
        repeated: String,
        limit: usize,
    },

    #[error("blob store failure for {digest}: {source}")]
    Storage {
        digest: Digest,
        #[source]
        source: StoreError,
    },

    #[error("blob integrity mismatch: expected {expected}, store confirmed {actual}")]
    Integrity { expected: Digest, actual: Digest },

    #[error("manifest signing failed: {0}")]
    Sign(String),

    #[error("manifest verification failed: {0}")]
    Verify(String),

    #[error("publishing manifest {name}:{tag} failed: {source}")]
    Publish {
        name: String,
        tag: String,
        #[source]
        source: StoreError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PushError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PushError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn extraction(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        PushError::Extraction {
            path: path.into(),
            message: message.into(),
            source,
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        PushError::NotFound {
            kind,
            name: name.into(),
        }
    }
}
