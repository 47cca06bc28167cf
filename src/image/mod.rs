//! Turns resolved packages into layers, a config and manifests.

pub mod config;
pub mod layer;
pub mod manifest;
pub mod reproducible;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::error::{RegistryError, Result};
use crate::package::{PackageHeader, PackageRecord};

pub use config::{platform_for_arch, ImageConfig, ImageDefaults};
pub use layer::{Layer, LayerBuilder};
pub use manifest::{
    assemble, assemble_index, AssembledImage, BlobData, Descriptor, ImageIndex, ImageManifest, ManifestFormat,
    Platform, PlatformDescriptor,
};

/// How packages map onto layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LayerMode {
    /// One layer per package, in composition order. Shared packages give
    /// shared layers across images.
    #[default]
    PerPackage,
    /// A single layer with every package merged, later packages winning.
    Squashed,
}

/// Everything produced for one image build.
#[derive(Debug, Clone)]
pub struct SynthesizedImage {
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
    pub assembled: AssembledImage,
}

impl SynthesizedImage {
    pub fn platform(&self) -> Platform {
        Platform::of(&self.config)
    }

    /// Layer, config and manifest blobs, each once.
    pub fn blobs(&self) -> Vec<BlobData> {
        let mut blobs = Vec::with_capacity(self.layers.len() + 3);
        self.collect_blobs(&mut blobs);
        blobs
    }

    fn collect_blobs(&self, blobs: &mut Vec<BlobData>) {
        let layers = self.layers.iter().map(|layer| BlobData {
            digest: layer.digest.clone(),
            media_type: layer.media_type,
            bytes: layer.bytes.clone(),
        });
        let rest = std::iter::once(self.assembled.config.clone())
            .chain(self.assembled.manifests.iter().map(|(_, b)| b.clone()));
        for blob in layers.chain(rest) {
            if !blobs.iter().any(|b| b.digest == blob.digest) {
                blobs.push(blob);
            }
        }
    }
}

/// The images behind one tag: a single image, or one per platform tied
/// together by an index.
#[derive(Debug, Clone)]
pub struct ImageSet {
    pub images: Vec<SynthesizedImage>,
    /// One index per [`ManifestFormat`]; empty for a single image.
    pub index: Vec<(ManifestFormat, BlobData)>,
}

impl ImageSet {
    /// Every blob of every image plus the indexes, each once.
    pub fn blobs(&self) -> Vec<BlobData> {
        let mut blobs = Vec::new();
        for image in &self.images {
            image.collect_blobs(&mut blobs);
        }
        blobs.extend(self.index.iter().map(|(_, b)| b.clone()));
        blobs
    }

    pub fn is_multi_platform(&self) -> bool {
        !self.index.is_empty()
    }
}

/// Split `records` by the platform their arch maps to, keeping order.
/// Packages without a platform (`noarch`) go into every group. Fewer than
/// two platforms give a single group with everything.
pub fn split_by_platform(records: &[Arc<PackageRecord>]) -> Vec<Vec<Arc<PackageRecord>>> {
    let platforms: BTreeSet<_> = records
        .iter()
        .filter_map(|r| platform_for_arch(&r.header().arch))
        .collect();
    if platforms.len() < 2 {
        return vec![records.to_vec()];
    }
    platforms
        .into_iter()
        .map(|platform| {
            records
                .iter()
                .filter(|r| platform_for_arch(&r.header().arch).map_or(true, |p| p == platform))
                .cloned()
                .collect()
        })
        .collect()
}

/// Synchronous image pipeline. Builds read package payloads and compress
/// them, so async callers run it on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct ImageSynthesizer {
    mode: LayerMode,
    defaults: ImageDefaults,
}

impl ImageSynthesizer {
    pub fn new(mode: LayerMode, defaults: ImageDefaults) -> Self {
        Self { mode, defaults }
    }

    pub fn mode(&self) -> LayerMode {
        self.mode
    }

    /// Build the image for `records`, which must already be in composition
    /// order. Any unreadable payload fails the whole build.
    #[instrument(skip(self, records), fields(packages = records.len()))]
    pub fn synthesize(&self, records: &[Arc<PackageRecord>]) -> Result<SynthesizedImage> {
        if records.is_empty() {
            return Err(RegistryError::Internal("no packages to synthesize".to_string()));
        }
        let started = Instant::now();

        let layers = match self.mode {
            LayerMode::PerPackage => records
                .iter()
                .enumerate()
                .map(|(idx, record)| {
                    LayerBuilder::for_package(records, idx, record.header().nevra())?.build()
                })
                .collect::<Result<Vec<_>>>()?,
            LayerMode::Squashed => {
                let created_by = records
                    .iter()
                    .map(|r| r.header().nevra())
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![LayerBuilder::squashed(records, created_by)?.build()?]
            }
        };

        let headers: Vec<&PackageHeader> = records.iter().map(|r| r.header()).collect();
        let config = ImageConfig::for_packages(&self.defaults, &headers, &layers);
        let assembled = assemble(&config, &layers)?;

        debug!(
            layers = layers.len(),
            config = %assembled.config.digest.short(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image synthesized"
        );

        Ok(SynthesizedImage {
            config,
            layers,
            assembled,
        })
    }

    /// Build every platform image for `records` and, when there is more
    /// than one, the index naming them.
    #[instrument(skip(self, records), fields(packages = records.len()))]
    pub fn synthesize_all(&self, records: &[Arc<PackageRecord>]) -> Result<ImageSet> {
        let images = split_by_platform(records)
            .iter()
            .map(|group| self.synthesize(group))
            .collect::<Result<Vec<_>>>()?;

        let index = if images.len() > 1 {
            let platforms: Vec<_> = images.iter().map(|i| (i.platform(), &i.assembled)).collect();
            assemble_index(&platforms)?
        } else {
            Vec::new()
        };
        debug!(platforms = images.len(), "Image set synthesized");
        Ok(ImageSet { images, index })
    }
}
