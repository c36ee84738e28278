use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use flate2::read::GzDecoder;

use crate::error::{PushError, Result};
use crate::progress::{Reporter, format_bytes};

/// A local image reference: `name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Parse `name:tag` handling registry port syntax (`registry:5000/foo:bar`).
    pub fn parse(image: &str) -> Self {
        let (repository, tag) = match image.rsplit_once(':') {
            Some((n, t)) if !t.contains('/') => (n, t),
            _ => (image, "latest"),
        };
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Produces the `docker save`-style archive for an image.
pub trait ImageExporter {
    fn export(&self, image: &ImageRef) -> Result<Box<dyn Read>>;
}

/// Which CLI flavour is on the other end of the runtime binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Guess from the binary name; anything unrecognised is treated as docker.
    pub fn from_binary(cmd: &str) -> Self {
        let name = std::path::Path::new(cmd)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.starts_with("podman") {
            RuntimeKind::Podman
        } else {
            RuntimeKind::Docker
        }
    }
}

/// Exports through the container runtime CLI (`docker save` / `podman save`).
pub struct RuntimeExporter {
    cmd: String,
    kind: RuntimeKind,
    reporter: Reporter,
}

impl RuntimeExporter {
    pub fn new(cmd: impl Into<String>) -> Self {
        let cmd = cmd.into();
        let kind = RuntimeKind::from_binary(&cmd);
        Self {
            cmd,
            kind,
            reporter: Reporter::disabled(),
        }
    }

    /// Show a spinner with the running byte count while saving.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    fn failed(&self, image: &ImageRef, message: impl Into<String>) -> PushError {
        PushError::Export {
            image: image.to_string(),
            message: message.into(),
        }
    }
}

impl ImageExporter for RuntimeExporter {
    /// Pipe the runtime's stdout into an anonymous temp file, then hand back a
    /// reader over it. The file disappears when the reader is dropped.
    fn export(&self, image: &ImageRef) -> Result<Box<dyn Read>> {
        let reference = image.to_string();

        let mut cmd = Command::new(&self.cmd);
        cmd.args(["save", &reference]);
        if self.kind == RuntimeKind::Podman {
            cmd.arg("--format=docker-archive");
        }

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failed(image, format!("failed to run '{} save': {e}", self.cmd)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.failed(image, "failed to capture stdout"))?;
        // Drained alongside stdout so a chatty runtime cannot fill the pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });
        let mut file =
            tempfile::tempfile().map_err(|e| self.failed(image, format!("temp file: {e}")))?;
        let spinner = self.reporter.spinner(format!("Saving {reference}..."));

        let copied = {
            let mut buf = [0u8; 64 * 1024];
            let mut total = 0u64;
            loop {
                let n = match stdout.read(&mut buf) {
                    Ok(0) => break Ok(total),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = file.write_all(&buf[..n]) {
                    break Err(e);
                }
                total += n as u64;
                spinner.set_message(format!("Saving {reference} ({})", format_bytes(total)));
            }
        };
        drop(stdout);

        let status = child.wait();
        let stderr_str = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let status = status
            .map_err(|e| self.failed(image, format!("waiting for '{} save': {e}", self.cmd)))?;
        if !status.success() {
            spinner.abandon();
            return Err(self.failed(image, stderr_str.trim().to_string()));
        }
        let size = match copied {
            Ok(size) => size,
            Err(e) => {
                spinner.abandon();
                return Err(self.failed(image, format!("reading archive: {e}")));
            }
        };

        file.seek(SeekFrom::Start(0))
            .map_err(|e| self.failed(image, format!("rewinding archive: {e}")))?;
        spinner.finish(format!("Saved {reference} ({})", format_bytes(size)));
        tracing::debug!(image = %image, bytes = size, runtime = %self.cmd, "Exported image");

        Ok(Box::new(file))
    }
}

/// Uses an archive produced earlier by `docker save` (optionally gzipped).
pub struct ArchiveFileExporter {
    path: PathBuf,
}

impl ArchiveFileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ImageExporter for ArchiveFileExporter {
    fn export(&self, image: &ImageRef) -> Result<Box<dyn Read>> {
        let file = File::open(&self.path).map_err(|e| PushError::Export {
            image: image.to_string(),
            message: format!("failed to open {}: {e}", self.path.display()),
        })?;
        let mut reader = BufReader::new(file);

        let is_gzip = reader
            .fill_buf()
            .map(|head| head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b)
            .map_err(|e| PushError::Export {
                image: image.to_string(),
                message: format!("failed to read {}: {e}", self.path.display()),
            })?;

        if is_gzip {
            Ok(Box::new(GzDecoder::new(reader)))
        } else {
            Ok(Box::new(reader))
        }
    }
}

/// Whether a CLI argument names an archive file rather than an image.
pub fn looks_like_archive(image: &str) -> bool {
    let p = std::path::Path::new(image);
    matches!(
        p.extension().and_then(|e| e.to_str()),
        Some("tar" | "gz" | "tgz")
    ) || image.ends_with(".tar.gz")
}
