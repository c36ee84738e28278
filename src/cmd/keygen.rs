use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use crossterm::style::Stylize;

use layerpush::manifest::EcdsaKey;

pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let key = EcdsaKey::generate();
    let pem = key.to_pem()?;
    write_private(path, pem.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    eprintln!("{} Wrote signing key to {}", "✔".green(), path.display());
    println!("{}", key.key_id()?);
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}
