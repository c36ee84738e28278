//! Schema 1 image manifests.

pub mod sign;

use serde::{Deserialize, Serialize};

use crate::bundle::ImageLayer;
use crate::digest::Digest;
use crate::registry::Descriptor;

pub use sign::{EcdsaKey, ManifestSigner, SignedManifest, sign_manifest, verify};

const SCHEMA_VERSION: u32 = 1;
const DEFAULT_ARCHITECTURE: &str = "amd64";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    pub architecture: String,
    /// Leaf layer first, root layer last.
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    /// Parallel to `fs_layers`.
    pub history: Vec<History>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// Accumulates entries in the order layers are walked (leaf to root).
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            manifest: Manifest {
                schema_version: SCHEMA_VERSION,
                name: name.into(),
                tag: tag.into(),
                architecture: String::new(),
                fs_layers: Vec::new(),
                history: Vec::new(),
            },
        }
    }

    /// Append the next layer. The first layer pushed is the leaf and sets the
    /// architecture.
    pub fn push_layer(&mut self, layer: &ImageLayer, descriptor: &Descriptor) -> &mut Self {
        if self.manifest.fs_layers.is_empty() {
            self.manifest.architecture = layer
                .architecture
                .clone()
                .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string());
        }
        self.manifest.fs_layers.push(FsLayer {
            blob_sum: descriptor.digest.clone(),
        });
        self.manifest.history.push(History {
            v1_compatibility: layer.v1_compatibility.clone(),
        });
        self
    }

    pub fn build(self) -> Manifest {
        self.manifest
    }
}
