//! Serve installed system packages as OCI container images.
//!
//! Images are synthesized on demand from the host package database: each
//! pull resolves an image name and tag to packages, turns their files into
//! deterministic layers and serves the result through a read-only
//! distribution API.

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod package;
pub mod server;
pub mod store;

pub use coordinator::{BuildCoordinator, BuiltImage, PlatformBuild};
pub use digest::Digest;
pub use error::{RegistryError, Result};
pub use image::{ImageSynthesizer, LayerMode};
pub use package::{PackageDatabase, PackageInspector};
pub use store::BlobStore;
