use std::path::PathBuf;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use layerpush::config::{self, CliOverrides, PushConfig};
use layerpush::export::{
    ArchiveFileExporter, ImageExporter, ImageRef, RuntimeExporter, looks_like_archive,
};
use layerpush::manifest::EcdsaKey;
use layerpush::progress::Reporter;
use layerpush::push::{PushReceipt, PushRequest, Pusher};
use layerpush::registry::{BlobStore, FsRegistry, ManifestStore, MemoryRegistry};

pub fn run(
    image: &str,
    name: &str,
    commit: &str,
    archive: Option<PathBuf>,
    overrides: CliOverrides,
) -> Result<()> {
    if archive.is_none() && looks_like_archive(image) {
        anyhow::bail!(
            "'{image}' looks like an archive file; pass it with --archive and name the image to push"
        );
    }

    let cfg = config::init_from_cli(overrides)?;
    let reporter = Reporter::new(cfg.progress);
    let image_ref = ImageRef::parse(image);

    let exporter: Box<dyn ImageExporter> = match archive {
        Some(path) => Box::new(ArchiveFileExporter::new(path)),
        None => Box::new(RuntimeExporter::new(cfg.runtime.clone()).with_reporter(reporter)),
    };
    let key = signing_key(cfg)?;

    let request = PushRequest::new(image_ref, name, commit).with_max_depth(cfg.max_depth);

    let receipt = if cfg.dry_run {
        let registry = MemoryRegistry::new();
        push_to(&*exporter, &registry, &registry, &key, reporter, &request)?
    } else {
        std::fs::create_dir_all(&cfg.registry).with_context(|| {
            format!("Failed to create registry root {}", cfg.registry.display())
        })?;
        let registry = FsRegistry::new(&cfg.registry);
        push_to(&*exporter, &registry, &registry, &key, reporter, &request)?
    };

    print_summary(cfg, &receipt);
    println!("Pushed {image} as {name}@{}", receipt.digest());
    Ok(())
}

fn push_to(
    exporter: &dyn ImageExporter,
    blobs: &dyn BlobStore,
    manifests: &dyn ManifestStore,
    key: &EcdsaKey,
    reporter: Reporter,
    request: &PushRequest,
) -> Result<PushReceipt> {
    let mut pusher = Pusher::new(exporter, blobs, manifests, key).with_reporter(reporter);
    let result = pusher.push(request);
    result.with_context(|| match pusher.failed_after() {
        Some(state) => format!("Push of {} failed after reaching '{state}'", request.image),
        None => format!("Push of {} failed", request.image),
    })
}

fn signing_key(cfg: &PushConfig) -> Result<EcdsaKey> {
    match &cfg.key {
        Some(path) => EcdsaKey::load(path)
            .with_context(|| format!("Failed to load signing key {}", path.display())),
        None => {
            tracing::info!("No signing key configured, generating an ephemeral one");
            Ok(EcdsaKey::generate())
        }
    }
}

fn print_summary(cfg: &PushConfig, receipt: &PushReceipt) {
    let reused = receipt.layers.len() - receipt.uploaded();
    eprintln!(
        "{} {} layers ({} uploaded, {} already present)",
        "Layers".dim(),
        receipt.layers.len(),
        receipt.uploaded(),
        reused
    );
    if cfg.dry_run {
        eprintln!(
            "{} {}",
            "Registry".dim(),
            style::style("dry run, nothing was written").yellow()
        );
    } else {
        eprintln!(
            "{} {}",
            "Registry".dim(),
            style::style(cfg.registry.display()).dim()
        );
    }
}
