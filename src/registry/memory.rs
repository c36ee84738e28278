//! In-process registry. Backs `--dry-run` and lets tests observe every call.

use std::collections::HashMap;
use std::io::{self, Write};

use parking_lot::Mutex;

use super::{
    BlobPresence, BlobStore, BlobWriter, Descriptor, ManifestStore, StoreError, validate_name,
    validate_tag,
};
use crate::digest::Digest;
use crate::manifest::SignedManifest;

/// Call counters, for asserting what reached the "network".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub stats: usize,
    pub creates: usize,
    pub commits: usize,
    pub puts: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.stats + self.creates + self.commits + self.puts
    }
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<Digest, Vec<u8>>,
    manifests: HashMap<(String, String), SignedManifest>,
    calls: CallCounts,
    fail_stat: bool,
    corrupt_commits: bool,
    fail_writes: bool,
    reject_puts: bool,
}

#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob directly, bypassing upload accounting.
    pub fn seed_blob(&self, data: &[u8]) -> Digest {
        let digest = Digest::from_bytes(data);
        self.inner.lock().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    /// Make every existence check come back indeterminate.
    pub fn fail_existence_checks(&self) {
        self.inner.lock().fail_stat = true;
    }

    /// Make every commit report that the received bytes hash differently.
    pub fn corrupt_commits(&self) {
        self.inner.lock().corrupt_commits = true;
    }

    /// Make every upload write fail, as if the connection dropped mid-stream.
    pub fn fail_writes(&self) {
        self.inner.lock().fail_writes = true;
    }

    pub fn reject_manifests(&self) {
        self.inner.lock().reject_puts = true;
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.lock().calls
    }

    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(digest).cloned()
    }

    pub fn manifest(&self, name: &str, tag: &str) -> Option<SignedManifest> {
        self.inner
            .lock()
            .manifests
            .get(&(name.to_string(), tag.to_string()))
            .cloned()
    }

    pub fn manifest_count(&self) -> usize {
        self.inner.lock().manifests.len()
    }
}

impl BlobStore for MemoryRegistry {
    fn stat(&self, digest: &Digest) -> BlobPresence {
        let mut inner = self.inner.lock();
        inner.calls.stats += 1;
        if inner.fail_stat {
            return BlobPresence::Unknown(StoreError::Backend(
                "existence check timed out".to_string(),
            ));
        }
        match inner.blobs.get(digest) {
            Some(data) => BlobPresence::Found(Descriptor {
                digest: digest.clone(),
                size: data.len() as u64,
            }),
            None => BlobPresence::Absent,
        }
    }

    fn create(&self) -> Result<Box<dyn BlobWriter + '_>, StoreError> {
        self.inner.lock().calls.creates += 1;
        Ok(Box::new(MemoryBlobWriter {
            registry: self,
            buf: Vec::new(),
        }))
    }
}

impl ManifestStore for MemoryRegistry {
    fn put(&self, manifest: &SignedManifest) -> Result<(), StoreError> {
        validate_name(&manifest.name)?;
        validate_tag(&manifest.tag)?;

        let mut inner = self.inner.lock();
        inner.calls.puts += 1;
        if inner.reject_puts {
            return Err(StoreError::Backend("manifest rejected".to_string()));
        }
        inner.manifests.insert(
            (manifest.name.clone(), manifest.tag.clone()),
            manifest.clone(),
        );
        Ok(())
    }
}

struct MemoryBlobWriter<'a> {
    registry: &'a MemoryRegistry,
    buf: Vec<u8>,
}

impl Write for MemoryBlobWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.registry.inner.lock().fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "upload interrupted"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryBlobWriter<'_> {
    fn commit(self: Box<Self>, expected: &Digest) -> Result<Descriptor, StoreError> {
        let MemoryBlobWriter { registry, buf } = *self;
        let mut inner = registry.inner.lock();
        inner.calls.commits += 1;

        let mut actual = Digest::from_bytes(&buf);
        if inner.corrupt_commits {
            let mut garbled = buf.clone();
            garbled.push(0);
            actual = Digest::from_bytes(&garbled);
        }
        if &actual != expected {
            return Err(StoreError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        let size = buf.len() as u64;
        inner.blobs.entry(actual.clone()).or_insert(buf);
        Ok(Descriptor {
            digest: actual,
            size,
        })
    }
}
