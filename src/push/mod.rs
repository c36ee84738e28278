//! Drives one image from the local runtime into the registry.

pub mod blob;

use std::fmt;
use std::path::PathBuf;

use crate::bundle::{ImageBundle, ImageLayer};
use crate::config::DEFAULT_MAX_DEPTH;
use crate::digest::Digest;
use crate::error::{PushError, Result};
use crate::export::{ImageExporter, ImageRef};
use crate::manifest::{ManifestBuilder, ManifestSigner, SignedManifest, sign_manifest};
use crate::progress::Reporter;
use crate::registry::{BlobStore, ManifestStore};

pub use blob::{BlobOutcome, BlobPusher, MultiWriter};

/// Where a push currently stands. Transitions only move forward, except into
/// `Failed`, which is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Exported,
    Indexed,
    Walking,
    Uploading,
    Assembling,
    Signed,
    Published,
    Failed,
}

impl PushState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PushState::Published | PushState::Failed)
    }
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushState::Idle => "idle",
            PushState::Exported => "exported",
            PushState::Indexed => "indexed",
            PushState::Walking => "walking",
            PushState::Uploading => "uploading",
            PushState::Assembling => "assembling",
            PushState::Signed => "signed",
            PushState::Published => "published",
            PushState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to push and where to publish it.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub image: ImageRef,
    /// Destination repository name.
    pub name: String,
    /// Used as the manifest tag.
    pub commit: String,
    pub max_depth: usize,
    /// Parent directory for the temporary bundle.
    pub work_dir: PathBuf,
}

impl PushRequest {
    pub fn new(image: ImageRef, name: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            image,
            name: name.into(),
            commit: commit.into(),
            max_depth: DEFAULT_MAX_DEPTH,
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    pub id: String,
    pub digest: Digest,
    pub size: u64,
    pub uploaded: bool,
}

/// The result of a published push.
#[derive(Debug, Clone)]
pub struct PushReceipt {
    pub manifest: SignedManifest,
    /// Leaf first, in manifest order.
    pub layers: Vec<LayerReport>,
}

impl PushReceipt {
    pub fn digest(&self) -> &Digest {
        &self.manifest.digest
    }

    pub fn uploaded(&self) -> usize {
        self.layers.iter().filter(|l| l.uploaded).count()
    }
}

pub struct Pusher<'a> {
    exporter: &'a dyn ImageExporter,
    blobs: &'a dyn BlobStore,
    manifests: &'a dyn ManifestStore,
    signer: &'a dyn ManifestSigner,
    reporter: Reporter,
    state: PushState,
    trail: Vec<PushState>,
}

impl<'a> Pusher<'a> {
    pub fn new(
        exporter: &'a dyn ImageExporter,
        blobs: &'a dyn BlobStore,
        manifests: &'a dyn ManifestStore,
        signer: &'a dyn ManifestSigner,
    ) -> Self {
        Self {
            exporter,
            blobs,
            manifests,
            signer,
            reporter: Reporter::disabled(),
            state: PushState::Idle,
            trail: vec![PushState::Idle],
        }
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn trail(&self) -> &[PushState] {
        &self.trail
    }

    /// The state reached last before the push failed.
    pub fn failed_after(&self) -> Option<PushState> {
        match self.trail.as_slice() {
            [.., last, PushState::Failed] => Some(*last),
            _ => None,
        }
    }

    /// Run the whole pipeline. The bundle directory is removed before this
    /// returns, whatever the outcome.
    pub fn push(&mut self, request: &PushRequest) -> Result<PushReceipt> {
        let mut bundle = None;
        let result = self.run(request, &mut bundle);

        if let Err(e) = &result {
            tracing::debug!(state = %self.state, error = %e, "Push failed");
            self.enter(PushState::Failed);
        }
        if let Some(mut bundle) = bundle {
            if let Err(e) = bundle.close() {
                tracing::warn!("Failed to remove image bundle: {e}");
            }
        }
        result
    }

    fn run(&mut self, request: &PushRequest, slot: &mut Option<ImageBundle>) -> Result<PushReceipt> {
        let archive = self.exporter.export(&request.image)?;
        self.enter(PushState::Exported);

        let spinner = self.reporter.spinner("Unpacking archive...");
        let bundle = match ImageBundle::from_archive_in(archive, &request.work_dir) {
            Ok(bundle) => slot.insert(bundle),
            Err(e) => {
                spinner.abandon();
                return Err(e);
            }
        };
        self.enter(PushState::Indexed);
        spinner.finish(format!("Unpacked {}", request.image));

        let leaf = bundle
            .resolve_tag(&request.image.repository, &request.image.tag)?
            .to_string();
        self.enter(PushState::Walking);
        let layers = bundle
            .walk(&leaf, request.max_depth)
            .collect::<Result<Vec<ImageLayer>>>()?;
        tracing::info!(image = %request.image, layers = layers.len(), "Resolved layer chain");

        self.enter(PushState::Uploading);
        let pusher = BlobPusher::new(self.blobs, self.reporter);
        let mut builder = ManifestBuilder::new(&request.name, &request.commit);
        let mut reports = Vec::with_capacity(layers.len());
        for layer in &layers {
            let outcome = pusher.push_layer(bundle, layer)?;
            let descriptor = outcome.descriptor();
            builder.push_layer(layer, descriptor);
            reports.push(LayerReport {
                id: layer.id.clone(),
                digest: descriptor.digest.clone(),
                size: descriptor.size,
                uploaded: outcome.was_uploaded(),
            });
        }

        self.enter(PushState::Assembling);
        let manifest = builder.build();
        let signed = sign_manifest(&manifest, self.signer)?;
        self.enter(PushState::Signed);

        self.manifests
            .put(&signed)
            .map_err(|source| PushError::Publish {
                name: signed.name.clone(),
                tag: signed.tag.clone(),
                source,
            })?;
        self.enter(PushState::Published);
        self.reporter.done(format!(
            "Published {}:{} ({})",
            signed.name, signed.tag, signed.digest
        ));

        Ok(PushReceipt {
            manifest: signed,
            layers: reports,
        })
    }

    fn enter(&mut self, next: PushState) {
        debug_assert!(!self.state.is_terminal(), "push already finished");
        tracing::debug!(from = %self.state, to = %next, "Push state");
        self.state = next;
        self.trail.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::image_archive;
    use crate::manifest::EcdsaKey;
    use crate::registry::MemoryRegistry;
    use std::io::Read;

    struct BytesExporter(Vec<u8>);

    impl ImageExporter for BytesExporter {
        fn export(&self, _image: &ImageRef) -> Result<Box<dyn Read>> {
            Ok(Box::new(std::io::Cursor::new(self.0.clone())))
        }
    }

    fn request(work_dir: &std::path::Path) -> PushRequest {
        PushRequest::new(ImageRef::parse("app:latest"), "app", "c0ffee").with_work_dir(work_dir)
    }

    #[test]
    fn test_state_trail_on_success() {
        let exporter = BytesExporter(image_archive(
            r#"{"app":{"latest":"l2"}}"#,
            &[("l2", Some("l1"), b"two"), ("l1", None, b"one")],
        ));
        let registry = MemoryRegistry::new();
        let key = EcdsaKey::generate();
        let work = tempfile::tempdir().unwrap();

        let mut pusher = Pusher::new(&exporter, &registry, &registry, &key);
        let receipt = pusher.push(&request(work.path())).unwrap();

        assert_eq!(
            pusher.trail(),
            [
                PushState::Idle,
                PushState::Exported,
                PushState::Indexed,
                PushState::Walking,
                PushState::Uploading,
                PushState::Assembling,
                PushState::Signed,
                PushState::Published,
            ]
        );
        assert_eq!(receipt.layers.len(), 2);
        assert_eq!(receipt.uploaded(), 2);
        assert_eq!(receipt.layers[0].id, "l2");
        assert!(std::fs::read_dir(work.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_unknown_tag_fails_after_indexing() {
        let exporter = BytesExporter(image_archive(
            r#"{"app":{"stable":"l1"}}"#,
            &[("l1", None, b"one")],
        ));
        let registry = MemoryRegistry::new();
        let key = EcdsaKey::generate();
        let work = tempfile::tempdir().unwrap();

        let mut pusher = Pusher::new(&exporter, &registry, &registry, &key);
        let err = pusher.push(&request(work.path())).unwrap_err();

        assert!(matches!(err, PushError::NotFound { kind: "tag", .. }), "{err}");
        assert_eq!(pusher.state(), PushState::Failed);
        assert_eq!(pusher.trail()[pusher.trail().len() - 2], PushState::Indexed);
        assert_eq!(registry.calls().total(), 0);
        assert!(std::fs::read_dir(work.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_rejected_manifest_is_publish_error() {
        let exporter = BytesExporter(image_archive(
            r#"{"app":{"latest":"l1"}}"#,
            &[("l1", None, b"one")],
        ));
        let registry = MemoryRegistry::new();
        registry.reject_manifests();
        let key = EcdsaKey::generate();
        let work = tempfile::tempdir().unwrap();

        let mut pusher = Pusher::new(&exporter, &registry, &registry, &key);
        let err = pusher.push(&request(work.path())).unwrap_err();

        assert!(matches!(err, PushError::Publish { .. }), "{err}");
        assert_eq!(pusher.state(), PushState::Failed);
        assert_eq!(registry.manifest_count(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PushState::Uploading.to_string(), "uploading");
        assert!(PushState::Failed.is_terminal());
        assert!(!PushState::Signed.is_terminal());
    }
}
