//! A registry backed by a local directory, laid out like the distribution
//! storage driver:
//!
//! ```text
//! blobs/sha256/<hh>/<hex>/data
//! repositories/<name>/_manifests/revisions/sha256/<hex>/{data,link}
//! repositories/<name>/_manifests/tags/<tag>/current/link
//! _uploads/<uuid>
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::{
    BlobPresence, BlobStore, BlobWriter, Descriptor, ManifestStore, StoreError, validate_name,
    validate_tag,
};
use crate::digest::{Digest, Digester};
use crate::manifest::SignedManifest;

pub struct FsRegistry {
    root: PathBuf,
}

impl FsRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(&hex[..2])
            .join(hex)
            .join("data")
    }

    fn manifests_dir(&self, name: &str) -> PathBuf {
        self.root.join("repositories").join(name).join("_manifests")
    }

    fn tag_link(&self, name: &str, tag: &str) -> PathBuf {
        self.manifests_dir(name)
            .join("tags")
            .join(tag)
            .join("current")
            .join("link")
    }

    /// Manifests live under their repository, outside the blob namespace:
    /// their key is the payload digest, which the signed bytes do not hash to.
    fn revision_dir(&self, name: &str, digest: &Digest) -> PathBuf {
        self.manifests_dir(name)
            .join("revisions")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Signed manifest bytes currently tagged `name:tag`, if any.
    pub fn get_manifest(&self, name: &str, tag: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_name(name)?;
        validate_tag(tag)?;
        let link = match fs::read_to_string(self.tag_link(name, tag)) {
            Ok(link) => link,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let digest: Digest = link
            .trim()
            .parse()
            .map_err(|e| StoreError::Backend(format!("corrupt tag link: {e}")))?;
        Ok(Some(fs::read(self.revision_dir(name, &digest).join("data"))?))
    }

    fn uploads_dir(&self) -> PathBuf {
        self.root.join("_uploads")
    }

    /// Write `data` next to `target` and rename it into place.
    fn write_atomic(&self, target: &Path, data: &[u8]) -> Result<(), StoreError> {
        let parent = target
            .parent()
            .ok_or_else(|| StoreError::Backend(format!("no parent for {}", target.display())))?;
        fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

impl BlobStore for FsRegistry {
    fn stat(&self, digest: &Digest) -> BlobPresence {
        match fs::metadata(self.blob_path(digest)) {
            Ok(meta) => BlobPresence::Found(Descriptor {
                digest: digest.clone(),
                size: meta.len(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BlobPresence::Absent,
            Err(e) => BlobPresence::Unknown(e.into()),
        }
    }

    fn create(&self) -> Result<Box<dyn BlobWriter + '_>, StoreError> {
        let dir = self.uploads_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(uuid::Uuid::new_v4().to_string());
        let file = File::create(&path)?;
        Ok(Box::new(FsBlobWriter {
            registry: self,
            path,
            file: Some(file),
            digester: Digester::new(),
        }))
    }
}

impl ManifestStore for FsRegistry {
    fn put(&self, manifest: &SignedManifest) -> Result<(), StoreError> {
        validate_name(&manifest.name)?;
        validate_tag(&manifest.tag)?;

        let revision = self.revision_dir(&manifest.name, &manifest.digest);
        self.write_atomic(&revision.join("data"), &manifest.bytes)?;
        let link = manifest.digest.to_string();
        self.write_atomic(&revision.join("link"), link.as_bytes())?;
        // The tag link is written last; it is what makes the push visible.
        self.write_atomic(&self.tag_link(&manifest.name, &manifest.tag), link.as_bytes())?;

        tracing::debug!(
            name = %manifest.name,
            tag = %manifest.tag,
            digest = %manifest.digest,
            "Published manifest"
        );
        Ok(())
    }
}

/// Streams into `_uploads/<uuid>`, hashing independently of the caller.
struct FsBlobWriter<'a> {
    registry: &'a FsRegistry,
    path: PathBuf,
    file: Option<File>,
    digester: Digester,
}

impl Write for FsBlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("upload already committed"))?;
        let n = file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWriter for FsBlobWriter<'_> {
    fn commit(mut self: Box<Self>, expected: &Digest) -> Result<Descriptor, StoreError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let size = self.digester.len();
        let actual = std::mem::take(&mut self.digester).finish();
        if &actual != expected {
            return Err(StoreError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        let target = self.registry.blob_path(&actual);
        if target.exists() {
            // Same digest, same bytes: keep what is there.
            tracing::debug!(digest = %actual, "Blob already stored, discarding upload");
        } else {
            let parent = target
                .parent()
                .ok_or_else(|| StoreError::Backend(format!("no parent for {}", target.display())))?;
            fs::create_dir_all(parent)?;
            fs::rename(&self.path, &target)?;
        }

        Ok(Descriptor {
            digest: actual,
            size,
        })
    }
}

impl Drop for FsBlobWriter<'_> {
    fn drop(&mut self) {
        // Gone already if the upload was renamed into place.
        let _ = fs::remove_file(&self.path);
    }
}
