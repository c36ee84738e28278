use std::collections::HashSet;

use super::{ImageBundle, ImageLayer};
use crate::error::{PushError, Result};

/// Lazily follows parent ids from a leaf layer to the root (inclusive).
///
/// Yields at most `limit` layers. Revisiting an id or exceeding the limit
/// yields a single `Cycle` error; after any error the walker is exhausted.
pub struct LayerWalker<'a> {
    bundle: &'a ImageBundle,
    leaf: String,
    next: Option<String>,
    visited: HashSet<String>,
    limit: usize,
}

impl<'a> LayerWalker<'a> {
    pub(crate) fn new(bundle: &'a ImageBundle, leaf: &str, limit: usize) -> Self {
        Self {
            bundle,
            leaf: leaf.to_string(),
            next: Some(leaf.to_string()),
            visited: HashSet::new(),
            limit,
        }
    }
}

impl Iterator for LayerWalker<'_> {
    type Item = Result<ImageLayer>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;

        if self.visited.len() >= self.limit || !self.visited.insert(id.clone()) {
            return Some(Err(PushError::Cycle {
                leaf: self.leaf.clone(),
                repeated: id,
                limit: self.limit,
            }));
        }

        match self.bundle.load_layer(&id) {
            Ok(layer) => {
                self.next = layer.parent.clone();
                Some(Ok(layer))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl std::iter::FusedIterator for LayerWalker<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::image_archive;

    #[test]
    fn test_walk_visits_leaf_to_root() {
        let archive = image_archive(
            r#"{"app":{"latest":"l3"}}"#,
            &[
                ("l1", None, b"one"),
                ("l2", Some("l1"), b"two"),
                ("l3", Some("l2"), b"three"),
            ],
        );
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let ids: Vec<String> = bundle
            .walk("l3", 127)
            .map(|layer| layer.unwrap().id)
            .collect();
        assert_eq!(ids, ["l3", "l2", "l1"]);
    }

    #[test]
    fn test_walk_single_root_layer() {
        let archive = image_archive(r#"{"alpine":{"latest":"only"}}"#, &[("only", None, b"x")]);
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let layers: Vec<ImageLayer> = bundle.walk("only", 127).map(Result::unwrap).collect();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].parent, None);
    }

    #[test]
    fn test_walk_detects_cycle() {
        let archive = image_archive(
            r#"{"loop":{"latest":"a"}}"#,
            &[("a", Some("b"), b"a"), ("b", Some("a"), b"b")],
        );
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let results: Vec<_> = bundle.walk("a", 127).collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(PushError::Cycle { .. })));
    }

    #[test]
    fn test_walk_enforces_depth_limit() {
        let archive = image_archive(
            r#"{"app":{"latest":"l3"}}"#,
            &[
                ("l1", None, b"one"),
                ("l2", Some("l1"), b"two"),
                ("l3", Some("l2"), b"three"),
            ],
        );
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let mut walker = bundle.walk("l3", 2);
        assert!(walker.next().unwrap().is_ok());
        assert!(walker.next().unwrap().is_ok());
        assert!(matches!(
            walker.next(),
            Some(Err(PushError::Cycle { limit: 2, .. }))
        ));
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_walk_missing_parent_is_not_found() {
        let archive = image_archive(r#"{"app":{"latest":"l2"}}"#, &[("l2", Some("gone"), b"x")]);
        let bundle = ImageBundle::from_archive(archive.as_slice()).unwrap();

        let results: Vec<_> = bundle.walk("l2", 127).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[1],
            Err(PushError::NotFound { kind: "layer", .. })
        ));
    }
}
