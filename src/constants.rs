// Centralized constants for pkgimage to avoid magic numbers

/// OCI image manifest media type
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image config media type
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI gzip layer media type
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker image manifest v2 schema 2 media type
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image index media type, used when a tag spans several platforms
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Docker manifest list media type
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Docker image config media type
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Docker gzip layer media type
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Header carrying the digest of a served manifest or blob
pub const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Header advertising distribution API support on `/v2/`
pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";

/// Value of the API version header
pub const API_VERSION: &str = "registry/2.0";

/// gzip level used for every layer. Changing it changes every layer digest.
pub const LAYER_COMPRESSION_LEVEL: u32 = 6;

/// Name of the pinned compression profile, recorded in image history
pub const LAYER_COMPRESSION_PROFILE: &str = "gzip-6";

/// Creation timestamp written into every image config and history entry
pub const IMAGE_EPOCH: &str = "1970-01-01T00:00:00Z";

/// Chunk size used when streaming blob bodies (64 KiB)
pub const BLOB_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Default blob store capacity (2 GiB)
pub const DEFAULT_BLOB_CAPACITY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default port for the registry
pub const DEFAULT_PORT: u16 = 5000;

/// Capability prefix a package uses to declare the image it belongs to
pub const OCI_IMAGE_CAPABILITY: &str = "oci_image";

/// Tag resolving to the newest installed version of a package
pub const LATEST_TAG: &str = "latest";

/// Label listing the packages an image was synthesized from
pub const PACKAGES_LABEL: &str = "io.pkgimage.packages";
