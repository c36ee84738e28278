use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::Stylize;

use layerpush::manifest;

pub fn run(file: &Path) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let signed = manifest::verify(&bytes)
        .with_context(|| format!("{} is not a valid signed manifest", file.display()))?;

    eprintln!(
        "{} Signature valid for {}:{} ({} layers)",
        "✔".green(),
        signed.name,
        signed.tag,
        signed.manifest.fs_layers.len()
    );
    println!("{}", signed.digest);
    Ok(())
}
