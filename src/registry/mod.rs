//! Seams to the content-addressed blob store and the manifest store.

pub mod fs;
pub mod memory;

use std::io::{self, Write};

use thiserror::Error;

use crate::digest::Digest;
use crate::manifest::SignedManifest;

pub use fs::FsRegistry;
pub use memory::MemoryRegistry;

/// A store's receipt for a blob it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("content digest mismatch: expected {expected}, stored {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("{0}")]
    Backend(String),
}

/// Result of an existence check. `Unknown` is never read as a miss.
#[derive(Debug)]
pub enum BlobPresence {
    Found(Descriptor),
    Absent,
    Unknown(StoreError),
}

/// Write side of a single blob upload.
pub trait BlobWriter: Write {
    /// Finish the upload. The store checks the received bytes against
    /// `expected` and fails with [`StoreError::DigestMismatch`] if they differ.
    fn commit(self: Box<Self>, expected: &Digest) -> Result<Descriptor, StoreError>;
}

pub trait BlobStore {
    fn stat(&self, digest: &Digest) -> BlobPresence;

    fn create(&self) -> Result<Box<dyn BlobWriter + '_>, StoreError>;
}

pub trait ManifestStore {
    /// Publish under the manifest's name and tag. Either the whole manifest
    /// becomes visible or nothing does.
    fn put(&self, manifest: &SignedManifest) -> Result<(), StoreError>;
}

/// Repository names: lowercase path components of `[a-z0-9._-]`.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part.bytes().all(|b| {
                    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
                })
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Tags: `[A-Za-z0-9_.-]`, at most 128 chars, not starting with `.` or `-`.
pub(crate) fn validate_tag(tag: &str) -> Result<(), StoreError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(tag.to_string()))
    }
}
