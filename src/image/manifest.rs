use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::config::ImageConfig;
use super::layer::Layer;
use super::reproducible::canonical_json;
use crate::constants::{
    DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE,
    OCI_CONFIG_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use crate::digest::Digest;
use crate::error::{RegistryError, Result};

/// Manifest flavour a client can ask for through `Accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestFormat {
    Oci,
    Docker,
}

impl ManifestFormat {
    pub const ALL: [ManifestFormat; 2] = [ManifestFormat::Oci, ManifestFormat::Docker];

    pub fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_MANIFEST_MEDIA_TYPE,
            Self::Docker => DOCKER_MANIFEST_MEDIA_TYPE,
        }
    }

    /// Media type of a multi-platform index in this format.
    pub fn index_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_INDEX_MEDIA_TYPE,
            Self::Docker => DOCKER_MANIFEST_LIST_MEDIA_TYPE,
        }
    }

    pub fn config_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_CONFIG_MEDIA_TYPE,
            Self::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        }
    }

    pub fn layer_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_LAYER_MEDIA_TYPE,
            Self::Docker => DOCKER_LAYER_MEDIA_TYPE,
        }
    }

    /// Pick a format from an `Accept` header value. OCI wins unless the
    /// client lists only Docker types.
    pub fn negotiate<'a>(accepted: impl IntoIterator<Item = &'a str>) -> Self {
        let mut docker = false;
        for value in accepted {
            for media in value.split(',') {
                let media = media.split(';').next().unwrap_or("").trim();
                match media {
                    OCI_MANIFEST_MEDIA_TYPE | OCI_INDEX_MEDIA_TYPE => return Self::Oci,
                    DOCKER_MANIFEST_MEDIA_TYPE | DOCKER_MANIFEST_LIST_MEDIA_TYPE => docker = true,
                    _ => {}
                }
            }
        }
        if docker {
            Self::Docker
        } else {
            Self::Oci
        }
    }

    /// Format of a manifest or index media type.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.manifest_media_type() == media_type || f.index_media_type() == media_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Platform an image runs on, as named in an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn of(config: &ImageConfig) -> Self {
        Self {
            architecture: config.architecture.clone(),
            os: config.os.clone(),
            variant: config.variant.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    pub platform: Platform,
}

/// OCI image index or Docker manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<PlatformDescriptor>,
}

/// Content-addressed bytes ready for the blob store.
#[derive(Debug, Clone)]
pub struct BlobData {
    pub digest: Digest,
    pub media_type: &'static str,
    pub bytes: Bytes,
}

impl BlobData {
    pub fn new(media_type: &'static str, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            digest: Digest::of(&bytes),
            media_type,
            bytes,
        }
    }

    pub fn descriptor(&self, media_type: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: self.digest.clone(),
            size: self.bytes.len() as u64,
        }
    }
}

/// Config and manifests for one set of layers.
#[derive(Debug, Clone)]
pub struct AssembledImage {
    pub config: BlobData,
    /// One manifest per [`ManifestFormat`], in [`ManifestFormat::ALL`] order.
    pub manifests: Vec<(ManifestFormat, BlobData)>,
}

impl AssembledImage {
    pub fn manifest(&self, format: ManifestFormat) -> Option<&BlobData> {
        self.manifests.iter().find(|(f, _)| *f == format).map(|(_, b)| b)
    }
}

/// Serialize `config`, then describe it and `layers` in every manifest
/// format. Both manifests reference the same config and layer blobs.
pub fn assemble(config: &ImageConfig, layers: &[Layer]) -> Result<AssembledImage> {
    config.validate()?;
    let layer_diff_ids: Vec<_> = layers.iter().map(|l| &l.diff_id).collect();
    if config.rootfs.diff_ids.iter().collect::<Vec<_>>() != layer_diff_ids {
        return Err(RegistryError::InvalidConfig(
            "rootfs diff_ids do not match the layers".to_string(),
        ));
    }

    let config_json = canonical_json(config).map_err(|e| RegistryError::Internal(e.to_string()))?;
    let config_blob = BlobData::new(OCI_CONFIG_MEDIA_TYPE, config_json);

    let mut manifests = Vec::with_capacity(ManifestFormat::ALL.len());
    for format in ManifestFormat::ALL {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: format.manifest_media_type().to_string(),
            config: config_blob.descriptor(format.config_media_type()),
            layers: layers
                .iter()
                .map(|l| Descriptor {
                    media_type: format.layer_media_type().to_string(),
                    digest: l.digest.clone(),
                    size: l.size,
                })
                .collect(),
        };
        let json = canonical_json(&manifest).map_err(|e| RegistryError::Internal(e.to_string()))?;
        manifests.push((format, BlobData::new(format.manifest_media_type(), json)));
    }

    Ok(AssembledImage {
        config: config_blob,
        manifests,
    })
}

/// Index the per-platform manifests of `images` in every format. The OCI
/// index lists the OCI manifests and the Docker list the Docker ones.
pub fn assemble_index(images: &[(Platform, &AssembledImage)]) -> Result<Vec<(ManifestFormat, BlobData)>> {
    if images.len() < 2 {
        return Err(RegistryError::Internal("an index needs at least two platforms".to_string()));
    }
    for (i, (platform, _)) in images.iter().enumerate() {
        if images[..i].iter().any(|(other, _)| other == platform) {
            return Err(RegistryError::Internal(format!(
                "platform {}/{} appears twice in the index",
                platform.os, platform.architecture
            )));
        }
    }

    let mut indexes = Vec::with_capacity(ManifestFormat::ALL.len());
    for format in ManifestFormat::ALL {
        let mut manifests = Vec::with_capacity(images.len());
        for (platform, assembled) in images {
            let manifest = assembled.manifest(format).ok_or_else(|| {
                RegistryError::Internal(format!("no {} manifest to index", format.manifest_media_type()))
            })?;
            manifests.push(PlatformDescriptor {
                media_type: format.manifest_media_type().to_string(),
                digest: manifest.digest.clone(),
                size: manifest.bytes.len() as u64,
                platform: platform.clone(),
            });
        }
        let index = ImageIndex {
            schema_version: 2,
            media_type: format.index_media_type().to_string(),
            manifests,
        };
        let json = canonical_json(&index).map_err(|e| RegistryError::Internal(e.to_string()))?;
        indexes.push((format, BlobData::new(format.index_media_type(), json)));
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::config::ImageDefaults;

    fn fake_layer(content: &[u8]) -> Layer {
        Layer {
            digest: Digest::of(content),
            diff_id: Digest::of(&[content, &b"-raw"[..]].concat()),
            size: content.len() as u64,
            uncompressed_size: content.len() as u64 + 4,
            media_type: OCI_LAYER_MEDIA_TYPE,
            bytes: Bytes::copy_from_slice(content),
            created_by: "test".to_string(),
        }
    }

    #[test]
    fn test_negotiate_accept() {
        assert_eq!(ManifestFormat::negotiate([]), ManifestFormat::Oci);
        assert_eq!(
            ManifestFormat::negotiate([DOCKER_MANIFEST_MEDIA_TYPE]),
            ManifestFormat::Docker
        );
        let both = format!("{}; q=0.9, {}", DOCKER_MANIFEST_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE);
        assert_eq!(ManifestFormat::negotiate([both.as_str()]), ManifestFormat::Oci);
        assert_eq!(ManifestFormat::negotiate(["*/*"]), ManifestFormat::Oci);
        assert_eq!(
            ManifestFormat::negotiate([DOCKER_MANIFEST_LIST_MEDIA_TYPE]),
            ManifestFormat::Docker
        );
        assert_eq!(ManifestFormat::negotiate([OCI_INDEX_MEDIA_TYPE]), ManifestFormat::Oci);
    }

    fn platform(architecture: &str) -> Platform {
        Platform {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    #[test]
    fn test_index_lists_each_platform_manifest() {
        let amd64_layers = vec![fake_layer(b"amd64")];
        let arm64_layers = vec![fake_layer(b"arm64")];
        let amd64 = assemble(
            &ImageConfig::for_packages(&ImageDefaults::default(), &[], &amd64_layers),
            &amd64_layers,
        )
        .unwrap();
        let arm64 = assemble(
            &ImageConfig::for_packages(&ImageDefaults::default(), &[], &arm64_layers),
            &arm64_layers,
        )
        .unwrap();

        let indexes = assemble_index(&[(platform("amd64"), &amd64), (platform("arm64"), &arm64)]).unwrap();
        assert_eq!(indexes.len(), 2);

        let (format, oci) = &indexes[0];
        assert_eq!(*format, ManifestFormat::Oci);
        assert_eq!(oci.media_type, OCI_INDEX_MEDIA_TYPE);
        let parsed: ImageIndex = serde_json::from_slice(&oci.bytes).unwrap();
        assert_eq!(parsed.manifests.len(), 2);
        assert_eq!(parsed.manifests[0].platform.architecture, "amd64");
        assert_eq!(parsed.manifests[0].digest, amd64.manifest(ManifestFormat::Oci).unwrap().digest);
        assert_eq!(parsed.manifests[1].digest, arm64.manifest(ManifestFormat::Oci).unwrap().digest);

        let (_, docker) = &indexes[1];
        let parsed: ImageIndex = serde_json::from_slice(&docker.bytes).unwrap();
        assert_eq!(parsed.media_type, DOCKER_MANIFEST_LIST_MEDIA_TYPE);
        assert_eq!(parsed.manifests[1].media_type, DOCKER_MANIFEST_MEDIA_TYPE);
        assert_eq!(parsed.manifests[1].digest, arm64.manifest(ManifestFormat::Docker).unwrap().digest);
        // the variant stays out of the JSON when unset
        assert!(!String::from_utf8_lossy(&docker.bytes).contains("variant"));
    }

    #[test]
    fn test_index_rejects_single_or_repeated_platforms() {
        let layers = vec![fake_layer(b"one")];
        let image = assemble(&ImageConfig::for_packages(&ImageDefaults::default(), &[], &layers), &layers).unwrap();
        assert!(assemble_index(&[(platform("amd64"), &image)]).is_err());
        assert!(assemble_index(&[(platform("amd64"), &image), (platform("amd64"), &image)]).is_err());
    }

    #[test]
    fn test_assemble_is_stable_and_consistent() {
        let layers = vec![fake_layer(b"one"), fake_layer(b"two")];
        let config = ImageConfig::for_packages(&ImageDefaults::default(), &[], &layers);

        let first = assemble(&config, &layers).unwrap();
        let second = assemble(&config, &layers).unwrap();
        assert_eq!(first.config.digest, second.config.digest);

        let oci = first.manifest(ManifestFormat::Oci).unwrap();
        let docker = first.manifest(ManifestFormat::Docker).unwrap();
        assert_ne!(oci.digest, docker.digest);
        assert_eq!(oci.digest, second.manifest(ManifestFormat::Oci).unwrap().digest);

        let parsed: ImageManifest = serde_json::from_slice(&oci.bytes).unwrap();
        assert_eq!(parsed.config.digest, first.config.digest);
        assert_eq!(parsed.layers.len(), 2);
        assert_eq!(parsed.layers[1].digest, layers[1].digest);

        let parsed: ImageManifest = serde_json::from_slice(&docker.bytes).unwrap();
        assert_eq!(parsed.config.media_type, DOCKER_CONFIG_MEDIA_TYPE);
        assert_eq!(parsed.layers[0].media_type, DOCKER_LAYER_MEDIA_TYPE);
    }

    #[test]
    fn test_assemble_rejects_mismatched_layers() {
        let layers = vec![fake_layer(b"one")];
        let config = ImageConfig::for_packages(&ImageDefaults::default(), &[], &layers);
        let err = assemble(&config, &[fake_layer(b"other")]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
    }
}
