use std::fs::File;
use std::io::{self, Read, Write};

use indicatif::ProgressBar;

use crate::bundle::{ImageBundle, ImageLayer};
use crate::digest::{Digest, Digester};
use crate::error::{PushError, Result};
use crate::progress::{ProgressWriter, Reporter};
use crate::registry::{BlobPresence, BlobStore, Descriptor, StoreError};

/// Forwards every write to all sinks, so one read pass can feed several
/// consumers without buffering the payload.
pub struct MultiWriter<'a> {
    sinks: Vec<&'a mut dyn Write>,
}

impl<'a> MultiWriter<'a> {
    pub fn new(sinks: Vec<&'a mut dyn Write>) -> Self {
        Self { sinks }
    }
}

impl Write for MultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &mut self.sinks {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

/// What happened to one layer's blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOutcome {
    /// Already in the store; nothing was sent.
    Existing(Descriptor),
    Uploaded(Descriptor),
}

impl BlobOutcome {
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            BlobOutcome::Existing(d) | BlobOutcome::Uploaded(d) => d,
        }
    }

    pub fn was_uploaded(&self) -> bool {
        matches!(self, BlobOutcome::Uploaded(_))
    }
}

pub struct BlobPusher<'a> {
    store: &'a dyn BlobStore,
    reporter: Reporter,
}

impl<'a> BlobPusher<'a> {
    pub fn new(store: &'a dyn BlobStore, reporter: Reporter) -> Self {
        Self { store, reporter }
    }

    /// Make sure the layer's payload is in the store, uploading it if absent.
    pub fn push_layer(&self, bundle: &ImageBundle, layer: &ImageLayer) -> Result<BlobOutcome> {
        let digest = bundle.layer_content_digest(&layer.id)?;
        tracing::debug!(layer = %layer.id, digest = %digest, "Computed layer digest");

        match self.store.stat(&digest) {
            BlobPresence::Found(found) => {
                tracing::info!(layer = %layer.id, digest = %digest, "Layer already pushed");
                Ok(BlobOutcome::Existing(Descriptor {
                    digest,
                    size: found.size,
                }))
            }
            BlobPresence::Absent => self.upload(bundle, layer, &digest),
            BlobPresence::Unknown(source) => Err(PushError::Storage { digest, source }),
        }
    }

    /// Stream the payload once into the store, the progress bar and a fresh
    /// digester, then commit against the freshly computed digest.
    fn upload(&self, bundle: &ImageBundle, layer: &ImageLayer, expected: &Digest) -> Result<BlobOutcome> {
        let path = bundle.layer_payload(&layer.id)?;
        let mut file = File::open(&path).map_err(|e| PushError::io(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| PushError::io(&path, e))?
            .len();

        let storage = |source: StoreError| PushError::Storage {
            digest: expected.clone(),
            source,
        };

        let mut writer = self.store.create().map_err(storage)?;
        let bar = self.reporter.bytes(size, format!("Pushing {}", short_id(&layer.id)));
        let computed = stream(&mut file, &mut writer, &bar).map_err(|e| storage(e.into()))?;
        if &computed != expected {
            bar.abandon();
            return Err(PushError::Integrity {
                expected: expected.clone(),
                actual: computed,
            });
        }

        let descriptor = writer.commit(&computed).map_err(|e| match e {
            StoreError::DigestMismatch { expected, actual } => {
                PushError::Integrity { expected, actual }
            }
            other => storage(other),
        });
        let descriptor = match descriptor {
            Ok(descriptor) => descriptor,
            Err(e) => {
                bar.abandon();
                return Err(e);
            }
        };
        if descriptor.digest != computed {
            bar.abandon();
            return Err(PushError::Integrity {
                expected: computed,
                actual: descriptor.digest,
            });
        }

        bar.finish_and_clear();
        self.reporter.done(format!(
            "Pushed {} ({})",
            short_id(&layer.id),
            crate::progress::format_bytes(size)
        ));
        tracing::info!(layer = %layer.id, digest = %computed, bytes = size, "Uploaded layer");

        Ok(BlobOutcome::Uploaded(descriptor))
    }
}

/// Copy `source` into `sink` while advancing `bar` and hashing. The bar is
/// abandoned if any sink fails.
fn stream(source: &mut impl Read, sink: &mut dyn Write, bar: &ProgressBar) -> io::Result<Digest> {
    let mut progress = ProgressWriter::new(bar.clone());
    let mut digester = Digester::new();
    let copied = {
        let sinks: Vec<&mut dyn Write> = vec![&mut *sink, &mut progress, &mut digester];
        let mut fan_out = MultiWriter::new(sinks);
        io::copy(source, &mut fan_out).and_then(|_| fan_out.flush())
    };
    match copied {
        Ok(()) => Ok(digester.finish()),
        Err(e) => {
            bar.abandon();
            Err(e)
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
