#![allow(dead_code)]

use std::io::{Cursor, Read};

use layerpush::export::{ImageExporter, ImageRef};
use layerpush::{PushError, Result};

/// One layer of a synthetic image: `(id, parent, payload)`.
pub type Layer<'a> = (&'a str, Option<&'a str>, &'a [u8]);

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// A `docker save` archive tagging `repository:tag` at the first layer given.
pub fn save_archive(repository: &str, tag: &str, layers: &[Layer<'_>]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (id, parent, payload) in layers {
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        dir.set_cksum();
        builder.append_data(&mut dir, format!("{id}/"), &[][..]).unwrap();

        let parent = parent.map(|p| format!(r#","parent":"{p}""#)).unwrap_or_default();
        let json = format!(r#"{{"id":"{id}"{parent},"architecture":"amd64","os":"linux"}}"#);
        append(&mut builder, &format!("{id}/json"), json.as_bytes());
        append(&mut builder, &format!("{id}/layer.tar"), payload);
    }
    let leaf = layers.first().map(|l| l.0).unwrap_or_default();
    let index = format!(r#"{{"{repository}":{{"{tag}":"{leaf}"}}}}"#);
    append(&mut builder, "repositories", index.as_bytes());
    builder.into_inner().unwrap()
}

/// Hands out a prepared archive, as if the runtime had just saved it.
pub struct StaticExporter(pub Vec<u8>);

impl ImageExporter for StaticExporter {
    fn export(&self, _image: &ImageRef) -> Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.0.clone())))
    }
}

/// A runtime that cannot find the image.
pub struct FailingExporter;

impl ImageExporter for FailingExporter {
    fn export(&self, image: &ImageRef) -> Result<Box<dyn Read>> {
        Err(PushError::Export {
            image: image.to_string(),
            message: "No such image".to_string(),
        })
    }
}

pub fn is_empty_dir(path: &std::path::Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}
