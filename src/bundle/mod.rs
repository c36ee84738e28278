//! An exported image, unpacked into a private temporary directory.
//!
//! The legacy `docker save` layout is expected:
//!
//! ```text
//! repositories            {"alpine": {"latest": "<leaf id>"}}
//! <id>/json               per-layer metadata (id, parent, architecture, ...)
//! <id>/layer.tar          raw layer payload
//! ```

pub mod extract;
pub mod walker;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempDir;

use crate::digest::Digest;
use crate::error::{PushError, Result};
use crate::export::{ImageExporter, ImageRef};

pub use walker::LayerWalker;

const INDEX_FILE: &str = "repositories";
const LAYER_JSON: &str = "json";
const LAYER_PAYLOAD: &str = "layer.tar";

/// repository name -> (tag -> leaf layer id)
pub type RepositoryIndex = HashMap<String, HashMap<String, String>>;

/// One layer's metadata as read from `<id>/json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayer {
    pub id: String,
    /// `None` for the root layer.
    pub parent: Option<String>,
    pub architecture: Option<String>,
    /// The metadata file verbatim; becomes the manifest's `v1Compatibility`.
    pub v1_compatibility: String,
}

#[derive(Deserialize)]
struct LayerConfig {
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
}

pub struct ImageBundle {
    dir: Option<TempDir>,
    root: PathBuf,
    repositories: RepositoryIndex,
}

impl ImageBundle {
    /// Export `image` through `exporter` and unpack it under `work_dir`.
    ///
    /// The temporary directory is only created once the export succeeded, and
    /// it is removed again if unpacking or index decoding fails.
    pub fn open(exporter: &dyn ImageExporter, image: &ImageRef, work_dir: &Path) -> Result<Self> {
        let archive = exporter.export(image)?;
        Self::from_archive_in(archive, work_dir)
    }

    /// Unpack an already exported archive stream into the system temp dir.
    pub fn from_archive<R: Read>(archive: R) -> Result<Self> {
        Self::from_archive_in(archive, &std::env::temp_dir())
    }

    pub fn from_archive_in<R: Read>(archive: R, work_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("layerpush-bundle-")
            .tempdir_in(work_dir)
            .map_err(|e| PushError::io(work_dir, e))?;
        let root = dir.path().to_path_buf();

        let unpacked = extract::unpack(archive, &root).and_then(|_| read_index(&root));
        let repositories = match unpacked {
            Ok(repositories) => repositories,
            Err(e) => {
                if let Err(cleanup) = remove_tree(dir) {
                    tracing::warn!("Failed to remove partial image bundle: {cleanup}");
                }
                return Err(e);
            }
        };

        tracing::debug!(
            dir = %root.display(),
            repositories = repositories.len(),
            "Opened image bundle"
        );

        Ok(Self {
            dir: Some(dir),
            root,
            repositories,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn repositories(&self) -> &RepositoryIndex {
        &self.repositories
    }

    /// Leaf layer id for `repository:tag`.
    pub fn resolve_tag(&self, repository: &str, tag: &str) -> Result<&str> {
        let tags = self
            .repositories
            .get(repository)
            .ok_or_else(|| PushError::not_found("repository", repository))?;
        tags.get(tag)
            .map(String::as_str)
            .ok_or_else(|| PushError::not_found("tag", format!("{repository}:{tag}")))
    }

    pub fn load_layer(&self, id: &str) -> Result<ImageLayer> {
        let path = self.layer_dir(id)?.join(LAYER_JSON);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PushError::not_found("layer", id));
            }
            Err(e) => return Err(PushError::io(path, e)),
        };
        let config: LayerConfig =
            serde_json::from_str(&raw).map_err(|source| PushError::Decode {
                path: path.clone(),
                source,
            })?;

        Ok(ImageLayer {
            id: id.to_string(),
            parent: config.parent.filter(|p| !p.is_empty()),
            architecture: config.architecture.filter(|a| !a.is_empty()),
            v1_compatibility: raw,
        })
    }

    /// Path of the raw payload for layer `id`.
    pub fn layer_payload(&self, id: &str) -> Result<PathBuf> {
        let path = self.layer_dir(id)?.join(LAYER_PAYLOAD);
        if !path.is_file() {
            return Err(PushError::not_found("layer payload", id));
        }
        Ok(path)
    }

    /// Stream the layer payload through the digest function.
    pub fn layer_content_digest(&self, id: &str) -> Result<Digest> {
        let path = self.layer_payload(id)?;
        let mut file = File::open(&path).map_err(|e| PushError::io(&path, e))?;
        Digest::from_reader(&mut file).map_err(|e| PushError::io(&path, e))
    }

    /// Walk from `leaf` towards the root, refusing chains longer than `limit`.
    pub fn walk(&self, leaf: &str, limit: usize) -> LayerWalker<'_> {
        LayerWalker::new(self, leaf, limit)
    }

    /// Remove the extraction directory. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            remove_tree(dir)?;
            tracing::debug!(dir = %path.display(), "Removed image bundle");
        }
        Ok(())
    }

    fn layer_dir(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'));
        if !valid {
            return Err(PushError::not_found("layer", id));
        }
        Ok(self.root.join(id))
    }
}

impl Drop for ImageBundle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to remove image bundle: {e}");
        }
    }
}

/// Delete an extraction directory, including any read-only directories the
/// archive restored inside it.
fn remove_tree(dir: TempDir) -> Result<()> {
    let path = dir.path().to_path_buf();
    make_writable(&path).map_err(|e| PushError::io(&path, e))?;
    dir.close().map_err(|e| PushError::io(&path, e))
}

#[cfg(unix)]
fn make_writable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
    }
    for entry in fs::read_dir(path)? {
        make_writable(&entry?.path())?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn read_index(root: &Path) -> Result<RepositoryIndex> {
    let path = root.join(INDEX_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PushError::MissingIndex { path });
        }
        Err(e) => return Err(PushError::io(path, e)),
    };
    serde_json::from_slice(&data).map_err(|source| PushError::Decode { path, source })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A layer for [`image_archive`]: `(id, parent, payload)`.
    pub(crate) type TestLayer<'a> = (&'a str, Option<&'a str>, &'a [u8]);

    fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    /// Build a legacy `docker save` archive in memory.
    pub(crate) fn image_archive(index: &str, layers: &[TestLayer<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (id, parent, payload) in layers {
            let mut dir = tar::Header::new_gnu();
            dir.set_entry_type(tar::EntryType::Directory);
            dir.set_size(0);
            dir.set_mode(0o755);
            dir.set_cksum();
            builder
                .append_data(&mut dir, format!("{id}/"), &[][..])
                .unwrap();

            let json = match parent {
                Some(p) => format!(r#"{{"id":"{id}","parent":"{p}","architecture":"amd64"}}"#),
                None => format!(r#"{{"id":"{id}","architecture":"amd64"}}"#),
            };
            append(&mut builder, &format!("{id}/json"), json.as_bytes());
            append(&mut builder, &format!("{id}/VERSION"), b"1.0");
            append(&mut builder, &format!("{id}/layer.tar"), payload);
        }
        append(&mut builder, "repositories", index.as_bytes());
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_index_round_trip() {
        let archive = image_archive(
            r#"{"alpine":{"latest":"aaa","3.19":"aaa"},"web":{"v1":"bbb"}}"#,
            &[("aaa", None, b"base"), ("bbb", Some("aaa"), b"app")],
        );
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let mut expected = RepositoryIndex::new();
        expected.insert(
            "alpine".into(),
            HashMap::from([("latest".into(), "aaa".into()), ("3.19".into(), "aaa".into())]),
        );
        expected.insert("web".into(), HashMap::from([("v1".into(), "bbb".into())]));
        assert_eq!(bundle.repositories(), &expected);
        assert_eq!(bundle.resolve_tag("web", "v1").unwrap(), "bbb");
    }

    #[test]
    fn test_resolve_tag_not_found() {
        let archive = image_archive(r#"{"alpine":{"latest":"aaa"}}"#, &[("aaa", None, b"x")]);
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let err = bundle.resolve_tag("busybox", "latest").unwrap_err();
        assert!(matches!(err, PushError::NotFound { kind: "repository", .. }));
        let err = bundle.resolve_tag("alpine", "edge").unwrap_err();
        assert!(matches!(err, PushError::NotFound { kind: "tag", .. }));
    }

    #[test]
    fn test_load_layer_reads_metadata() {
        let archive = image_archive(
            r#"{"app":{"latest":"child"}}"#,
            &[("root", None, b"r"), ("child", Some("root"), b"c")],
        );
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let child = bundle.load_layer("child").unwrap();
        assert_eq!(child.parent.as_deref(), Some("root"));
        assert_eq!(child.architecture.as_deref(), Some("amd64"));
        assert!(child.v1_compatibility.contains(r#""id":"child""#));

        let root = bundle.load_layer("root").unwrap();
        assert_eq!(root.parent, None);

        assert!(matches!(
            bundle.load_layer("missing").unwrap_err(),
            PushError::NotFound { kind: "layer", .. }
        ));
        assert!(matches!(
            bundle.load_layer("../etc").unwrap_err(),
            PushError::NotFound { .. }
        ));
    }

    #[test]
    fn test_layer_content_digest_matches_payload() {
        let archive = image_archive(r#"{"a":{"b":"l1"}}"#, &[("l1", None, b"payload bytes")]);
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        assert_eq!(
            bundle.layer_content_digest("l1").unwrap(),
            Digest::from_bytes(b"payload bytes")
        );
    }

    #[test]
    fn test_missing_index_cleans_up() {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "l1/json", b"{}");
        let archive = builder.into_inner().unwrap();

        let work = tempfile::TempDir::new().unwrap();
        let err = ImageBundle::from_archive_in(archive.as_slice(), work.path())
            .err()
            .unwrap();
        assert!(matches!(err, PushError::MissingIndex { .. }), "{err}");
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_malformed_index_is_decode_error() {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "repositories", b"{not json");
        let archive = builder.into_inner().unwrap();

        let err = ImageBundle::from_archive(archive.as_slice()).err().unwrap();
        assert!(matches!(err, PushError::Decode { .. }), "{err}");
    }

    #[test]
    fn test_close_is_idempotent() {
        let archive = image_archive(r#"{"a":{"b":"l1"}}"#, &[("l1", None, b"x")]);
        let mut bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();
        let path = bundle.path().to_path_buf();
        assert!(path.exists());

        bundle.close().unwrap();
        assert!(!path.exists());
        bundle.close().unwrap();
        assert!(!path.exists());
    }

    fn read_only_dir(builder: &mut tar::Builder<Vec<u8>>, path: &str) {
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o555);
        dir.set_cksum();
        builder.append_data(&mut dir, path, &[][..]).unwrap();
    }

    #[test]
    fn test_close_removes_read_only_layer_dir() {
        // Directory entry after its contents, as some exporters write it.
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "l1/json", br#"{"id":"l1"}"#);
        append(&mut builder, "l1/layer.tar", b"x");
        read_only_dir(&mut builder, "l1/");
        append(&mut builder, "repositories", br#"{"a":{"b":"l1"}}"#);
        let archive = builder.into_inner().unwrap();

        let work = TempDir::new().unwrap();
        let mut bundle = ImageBundle::from_archive_in(archive.as_slice(), work.path()).unwrap();
        let path = bundle.path().to_path_buf();
        assert_eq!(bundle.layer_content_digest("l1").unwrap(), Digest::from_bytes(b"x"));

        bundle.close().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_open_removes_read_only_dirs() {
        let mut builder = tar::Builder::new(Vec::new());
        read_only_dir(&mut builder, "l1/");
        append(&mut builder, "l1/json", br#"{"id":"l1"}"#);
        let archive = builder.into_inner().unwrap();

        let work = TempDir::new().unwrap();
        let err = ImageBundle::from_archive_in(archive.as_slice(), work.path())
            .err()
            .unwrap();
        assert!(matches!(err, PushError::MissingIndex { .. }), "{err}");
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncated_archive_cleans_up() {
        let archive = image_archive(r#"{"a":{"b":"l1"}}"#, &[("l1", None, b"x")]);
        // Cut inside the header of `l1/layer.tar`.
        let cut = &archive[..2600];

        let work = TempDir::new().unwrap();
        let err = ImageBundle::from_archive_in(cut, work.path()).err().unwrap();
        assert!(matches!(err, PushError::Extraction { .. }), "{err}");
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    struct Saved(Option<Vec<u8>>);

    impl ImageExporter for Saved {
        fn export(&self, image: &ImageRef) -> Result<Box<dyn Read>> {
            match &self.0 {
                Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
                None => Err(PushError::Export {
                    image: image.to_string(),
                    message: "no such image".to_string(),
                }),
            }
        }
    }

    #[test]
    fn test_open_through_exporter() {
        let work = TempDir::new().unwrap();
        let archive = image_archive(r#"{"app":{"v1":"l1"}}"#, &[("l1", None, b"x")]);
        let image = ImageRef::parse("app:v1");

        let mut bundle = ImageBundle::open(&Saved(Some(archive)), &image, work.path()).unwrap();
        assert!(bundle.path().starts_with(work.path()));
        assert_eq!(bundle.resolve_tag(&image.repository, &image.tag).unwrap(), "l1");
        bundle.close().unwrap();
        assert!(fs::read_dir(work.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_failed_export_creates_no_directory() {
        let work = TempDir::new().unwrap();
        let err = ImageBundle::open(&Saved(None), &ImageRef::parse("ghost"), work.path())
            .err()
            .unwrap();
        assert!(matches!(err, PushError::Export { .. }), "{err}");
        assert!(fs::read_dir(work.path()).unwrap().next().is_none());
    }
}
