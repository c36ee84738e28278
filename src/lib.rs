//! Push a locally exported container image into a content-addressed registry
//! as a signed schema 1 manifest.
//!
//! The pipeline is: export the image from the runtime, unpack it into a
//! private [`bundle::ImageBundle`], walk its layers from leaf to root, upload
//! every blob the store does not already hold, then sign and publish the
//! manifest. [`push::Pusher`] sequences these stages.

pub mod bundle;
pub mod config;
pub mod digest;
pub mod error;
pub mod export;
pub mod manifest;
pub mod progress;
pub mod push;
pub mod registry;

pub use digest::Digest;
pub use error::{PushError, Result};
