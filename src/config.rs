//! Command line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::constants::{DEFAULT_BLOB_CAPACITY_BYTES, DEFAULT_PORT};
use crate::coordinator::BuildCoordinator;
use crate::image::{ImageDefaults, ImageSynthesizer, LayerMode};
use crate::package::{PackageDatabase, PackageInspector, RpmDatabase};
use crate::store::{BlobBackend, BlobStore, LocalStorage, MemoryBackend};

#[derive(Parser, Debug)]
#[command(name = "pkgimage")]
#[command(version, about = "Serve installed packages as OCI images")]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, env = "PKGIMAGE_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the registry
    Serve(ServeArgs),
    /// Build one image and print its manifest
    Inspect {
        /// `<image>[:<tag>]`
        reference: String,
        /// Print the Docker v2 manifest instead of the OCI one
        #[arg(long)]
        docker: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "PKGIMAGE_LISTEN", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub listen: IpAddr,

    #[arg(short, long, env = "PKGIMAGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl ServeArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    #[default]
    Memory,
    Fs,
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Root of the host whose package database is served
    #[arg(long, env = "PKGIMAGE_HOST_ROOT", default_value = "/", global = true)]
    pub host_root: PathBuf,

    /// rpm binary used to query the database
    #[arg(long, env = "PKGIMAGE_RPM", default_value = "rpm", global = true)]
    pub rpm: PathBuf,

    #[arg(long, env = "PKGIMAGE_LAYER_MODE", value_enum, default_value_t = LayerMode::PerPackage, global = true)]
    pub layer_mode: LayerMode,

    /// Serve every installed package as an image named after it
    #[arg(
        long,
        env = "PKGIMAGE_EXPOSE_PACKAGE_NAMES",
        default_value_t = true,
        action = clap::ArgAction::Set,
        global = true
    )]
    pub expose_package_names: bool,

    /// Architecture for images made only of noarch packages
    #[arg(long, env = "PKGIMAGE_DEFAULT_ARCH", default_value = "amd64", global = true)]
    pub default_arch: String,

    #[arg(
        long,
        env = "PKGIMAGE_CMD",
        value_delimiter = ',',
        default_value = "/bin/sh",
        global = true
    )]
    pub cmd: Vec<String>,

    #[arg(long, env = "PKGIMAGE_ENTRYPOINT", value_delimiter = ',', global = true)]
    pub entrypoint: Vec<String>,

    /// `KEY=VALUE`; repeat the flag for several variables. Values may
    /// contain commas.
    #[arg(
        long,
        env = "PKGIMAGE_ENV",
        default_value = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        global = true
    )]
    pub env: Vec<String>,

    #[arg(long, env = "PKGIMAGE_WORKDIR", global = true)]
    pub workdir: Option<String>,

    #[arg(long, env = "PKGIMAGE_STORE", value_enum, default_value_t = StoreBackend::Memory, global = true)]
    pub store: StoreBackend,

    /// Blob directory for the `fs` store
    #[arg(long, env = "PKGIMAGE_DATA_DIR", default_value = "/var/cache/pkgimage", global = true)]
    pub data_dir: PathBuf,

    /// Bytes of unreferenced blobs kept before eviction
    #[arg(long, env = "PKGIMAGE_BLOB_CAPACITY", default_value_t = DEFAULT_BLOB_CAPACITY_BYTES, global = true)]
    pub blob_capacity: u64,
}

impl Settings {
    pub fn image_defaults(&self) -> ImageDefaults {
        let non_empty = |v: &Vec<String>| (!v.is_empty()).then(|| v.clone());
        ImageDefaults {
            architecture: self.default_arch.clone(),
            os: "linux".to_string(),
            env: self.env.clone(),
            entrypoint: non_empty(&self.entrypoint),
            cmd: non_empty(&self.cmd),
            working_dir: self.workdir.clone(),
        }
    }

    pub fn database(&self) -> anyhow::Result<Arc<dyn PackageDatabase>> {
        if !self.host_root.is_dir() {
            anyhow::bail!("Host root {} is not a directory", self.host_root.display());
        }
        Ok(Arc::new(RpmDatabase::new(&self.rpm, &self.host_root)))
    }

    pub fn blob_store(&self) -> anyhow::Result<BlobStore> {
        let backend: Arc<dyn BlobBackend> = match self.store {
            StoreBackend::Memory => Arc::new(MemoryBackend::new()),
            StoreBackend::Fs => Arc::new(
                LocalStorage::new(&self.data_dir)
                    .with_context(|| format!("Failed to create blob directory {}", self.data_dir.display()))?,
            ),
        };
        Ok(BlobStore::new(backend, self.blob_capacity))
    }

    /// Wire the database, synthesizer and store together.
    pub fn coordinator(&self) -> anyhow::Result<BuildCoordinator> {
        let inspector = PackageInspector::new(self.database()?, self.expose_package_names);
        let synthesizer = ImageSynthesizer::new(self.layer_mode, self.image_defaults());
        Ok(BuildCoordinator::new(inspector, synthesizer, Arc::new(self.blob_store()?)))
    }
}
