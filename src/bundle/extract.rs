use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tar::EntryType;

use crate::error::{PushError, Result};

/// Counts from one extraction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnpackStats {
    pub files: usize,
    pub dirs: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Materialize a tar stream under `dest`, one entry at a time.
///
/// Only directories and regular files are created; their stored permission
/// bits are applied. Any other entry type (symlinks, devices, ...) is skipped
/// with a warning. A read error anywhere before the end of the stream is fatal.
///
/// Directory modes are applied once the stream is exhausted, deepest first,
/// so a read-only directory listed before its contents still gets filled.
pub fn unpack<R: Read>(reader: R, dest: &Path) -> Result<UnpackStats> {
    let mut archive = tar::Archive::new(reader);
    let mut stats = UnpackStats::default();
    let mut dir_modes: Vec<(PathBuf, Option<u32>)> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| PushError::extraction(dest, "failed to read archive entries", Some(e)))?;

    for entry_result in entries {
        let mut entry = entry_result
            .map_err(|e| PushError::extraction(dest, "failed to read archive entry", Some(e)))?;

        let name = entry
            .path()
            .map_err(|e| PushError::extraction(dest, "entry has an unreadable path", Some(e)))?
            .to_path_buf();
        let target = dest.join(sanitize(&name).ok_or_else(|| {
            PushError::extraction(
                dest,
                format!("entry {} escapes the extraction root", name.display()),
                None,
            )
        })?);
        let mode = entry.header().mode().ok();

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| write_failed(dest, &target, e))?;
                dir_modes.push((target, mode));
                stats.dirs += 1;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| write_failed(dest, parent, e))?;
                }
                let mut file = File::create(&target).map_err(|e| write_failed(dest, &target, e))?;
                stats.bytes += io::copy(&mut entry, &mut file).map_err(|e| {
                    PushError::extraction(
                        dest,
                        format!("failed to copy {}", name.display()),
                        Some(e),
                    )
                })?;
                apply_mode(&target, mode).map_err(|e| write_failed(dest, &target, e))?;
                stats.files += 1;
            }
            other => {
                tracing::warn!(
                    path = %name.display(),
                    entry_type = ?other,
                    "Skipping unsupported archive entry"
                );
                stats.skipped += 1;
            }
        }
    }

    dir_modes.sort_by(|a, b| b.0.cmp(&a.0));
    for (target, mode) in &dir_modes {
        apply_mode(target, *mode).map_err(|e| write_failed(dest, target, e))?;
    }

    tracing::debug!(
        dest = %dest.display(),
        files = stats.files,
        dirs = stats.dirs,
        skipped = stats.skipped,
        bytes = stats.bytes,
        "Unpacked image archive"
    );

    Ok(stats)
}

/// Strip `./` prefixes and reject anything that would land outside the root.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

fn write_failed(dest: &Path, target: &Path, e: io::Error) -> PushError {
    PushError::extraction(dest, format!("failed to write {}", target.display()), Some(e))
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(entry_type: EntryType, size: u64, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_cksum();
        header
    }

    #[test]
    fn test_unpack_creates_dirs_and_files() {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header(EntryType::Directory, 0, 0o755), "abc/", &[][..])
            .unwrap();
        builder
            .append_data(&mut header(EntryType::Regular, 5, 0o644), "abc/json", &b"hello"[..])
            .unwrap();
        // Parent directory not listed explicitly.
        builder
            .append_data(&mut header(EntryType::Regular, 3, 0o600), "def/layer.tar", &b"xyz"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        let stats = unpack(data.as_slice(), dir.path()).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.bytes, 8);
        assert_eq!(fs::read(dir.path().join("abc/json")).unwrap(), b"hello");
        assert_eq!(fs::read(dir.path().join("def/layer.tar")).unwrap(), b"xyz");
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_applies_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header(EntryType::Regular, 2, 0o640), "perm.txt", &b"ok"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        unpack(data.as_slice(), dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join("perm.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn test_unpack_fills_read_only_dir_listed_first() {
        use std::os::unix::fs::PermissionsExt;

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header(EntryType::Directory, 0, 0o555), "ro/", &[][..])
            .unwrap();
        builder
            .append_data(&mut header(EntryType::Directory, 0, 0o555), "ro/inner/", &[][..])
            .unwrap();
        builder
            .append_data(&mut header(EntryType::Regular, 4, 0o644), "ro/inner/json", &b"{}\n\n"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        let stats = unpack(data.as_slice(), dir.path()).unwrap();

        assert_eq!(stats.dirs, 2);
        assert_eq!(fs::read(dir.path().join("ro/inner/json")).unwrap(), b"{}\n\n");
        for sub in ["ro", "ro/inner"] {
            let path = dir.path().join(sub);
            assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o555);
        }

        for sub in ["ro/inner", "ro"] {
            fs::set_permissions(dir.path().join(sub), fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn test_unpack_skips_unsupported_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut link = header(EntryType::Symlink, 0, 0o777);
        link.set_link_name("target").unwrap();
        link.set_cksum();
        builder.append_data(&mut link, "link", &[][..]).unwrap();
        builder
            .append_data(&mut header(EntryType::Regular, 1, 0o644), "file", &b"1"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        let stats = unpack(data.as_slice(), dir.path()).unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files, 1);
        assert!(!dir.path().join("link").exists());
    }

    #[test]
    fn test_unpack_truncated_stream_is_fatal() {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(
                &mut header(EntryType::Regular, 1024, 0o644),
                "big",
                &[7u8; 1024][..],
            )
            .unwrap();
        let data = builder.into_inner().unwrap();

        let dir = TempDir::new().unwrap();
        let err = unpack(&data[..300], dir.path()).unwrap_err();
        assert!(matches!(err, PushError::Extraction { .. }), "{err}");
    }

    #[test]
    fn test_sanitize_rejects_escape() {
        assert_eq!(sanitize(Path::new("./a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(sanitize(Path::new("../etc/passwd")), None);
        assert_eq!(sanitize(Path::new("/etc/passwd")), None);
    }
}
