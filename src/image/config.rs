use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::layer::Layer;
use crate::constants::{IMAGE_EPOCH, LAYER_COMPRESSION_PROFILE, PACKAGES_LABEL};
use crate::digest::Digest;
use crate::error::{RegistryError, Result};
use crate::package::PackageHeader;

/// Runtime settings baked into every synthesized image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefaults {
    /// Used when no package pins an architecture (all `noarch`).
    pub architecture: String,
    pub os: String,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
            entrypoint: None,
            cmd: Some(vec!["/bin/sh".to_string()]),
            working_dir: None,
        }
    }
}

/// OCI image configuration. Field order here is serialization order and
/// therefore part of the config digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub created: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub os: String,
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    pub history: Vec<History>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<Digest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub created: String,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl ImageConfig {
    /// Config for an image made of `packages` and stacked `layers`.
    pub fn for_packages(defaults: &ImageDefaults, packages: &[&PackageHeader], layers: &[Layer]) -> Self {
        let (architecture, variant) = image_platform(packages, &defaults.architecture);

        let mut labels = BTreeMap::new();
        labels.insert(
            PACKAGES_LABEL.to_string(),
            packages.iter().map(|p| p.nevra()).collect::<Vec<_>>().join(" "),
        );

        Self {
            created: IMAGE_EPOCH.to_string(),
            architecture,
            variant,
            os: defaults.os.clone(),
            config: ContainerConfig {
                env: defaults.env.clone(),
                entrypoint: defaults.entrypoint.clone(),
                cmd: defaults.cmd.clone(),
                working_dir: defaults.working_dir.clone(),
                labels,
            },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: layers.iter().map(|l| l.diff_id.clone()).collect(),
            },
            history: layers
                .iter()
                .map(|l| History {
                    created: IMAGE_EPOCH.to_string(),
                    created_by: l.created_by.clone(),
                    comment: Some(LAYER_COMPRESSION_PROFILE.to_string()),
                    empty_layer: None,
                })
                .collect(),
        }
    }

    /// Reject configs a client could not run.
    pub fn validate(&self) -> Result<()> {
        if self.architecture.trim().is_empty() {
            return Err(RegistryError::InvalidConfig("architecture is empty".to_string()));
        }
        if self.os.trim().is_empty() {
            return Err(RegistryError::InvalidConfig("os is empty".to_string()));
        }
        if self.rootfs.fs_type != "layers" {
            return Err(RegistryError::InvalidConfig(format!(
                "unsupported rootfs type {}",
                self.rootfs.fs_type
            )));
        }
        let non_empty = self.history.iter().filter(|h| h.empty_layer != Some(true)).count();
        if non_empty != self.rootfs.diff_ids.len() {
            return Err(RegistryError::InvalidConfig(format!(
                "{} history entries for {} layers",
                non_empty,
                self.rootfs.diff_ids.len()
            )));
        }
        Ok(())
    }
}

/// Map an rpm arch to a (GOARCH, variant) pair.
pub fn platform_for_arch(rpm_arch: &str) -> Option<(&'static str, Option<&'static str>)> {
    let platform = match rpm_arch {
        "x86_64" | "amd64" => ("amd64", None),
        "aarch64" | "arm64" => ("arm64", None),
        "i386" | "i486" | "i586" | "i686" => ("386", None),
        "armv7hl" | "armv7l" => ("arm", Some("v7")),
        "armv6hl" | "armv6l" => ("arm", Some("v6")),
        "ppc64le" => ("ppc64le", None),
        "s390x" => ("s390x", None),
        "riscv64" => ("riscv64", None),
        _ => return None,
    };
    Some(platform)
}

/// Platform of the first package with a known arch; `noarch` and unknown
/// arches fall back to the configured default.
fn image_platform(packages: &[&PackageHeader], default: &str) -> (String, Option<String>) {
    packages
        .iter()
        .find_map(|p| platform_for_arch(&p.arch))
        .map(|(arch, variant)| (arch.to_string(), variant.map(str::to_string)))
        .unwrap_or_else(|| (default.to_string(), None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, arch: &str) -> PackageHeader {
        PackageHeader {
            name: name.to_string(),
            epoch: None,
            version: "1.0".to_string(),
            release: "1".to_string(),
            arch: arch.to_string(),
            pkgid: "id".to_string(),
        }
    }

    #[test]
    fn test_platform_mapping() {
        assert_eq!(platform_for_arch("x86_64"), Some(("amd64", None)));
        assert_eq!(platform_for_arch("aarch64"), Some(("arm64", None)));
        assert_eq!(platform_for_arch("i686"), Some(("386", None)));
        assert_eq!(platform_for_arch("armv7hl"), Some(("arm", Some("v7"))));
        assert_eq!(platform_for_arch("noarch"), None);
    }

    #[test]
    fn test_noarch_uses_default_and_arch_package_wins() {
        let defaults = ImageDefaults::default();
        let data = header("data", "noarch");
        let tool = header("tool", "aarch64");

        let config = ImageConfig::for_packages(&defaults, &[&data], &[]);
        assert_eq!(config.architecture, "amd64");

        let config = ImageConfig::for_packages(&defaults, &[&data, &tool], &[]);
        assert_eq!(config.architecture, "arm64");
        assert_eq!(
            config.config.labels[PACKAGES_LABEL],
            "data-1.0-1.noarch tool-1.0-1.aarch64"
        );
    }

    #[test]
    fn test_validate_rejects_empty_platform() {
        let defaults = ImageDefaults {
            architecture: String::new(),
            ..ImageDefaults::default()
        };
        let config = ImageConfig::for_packages(&defaults, &[&header("data", "noarch")], &[]);
        assert!(matches!(config.validate(), Err(RegistryError::InvalidConfig(_))));

        let mut config = ImageConfig::for_packages(&ImageDefaults::default(), &[], &[]);
        config.validate().unwrap();
        config.os = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let config = ImageConfig::for_packages(&ImageDefaults::default(), &[&header("foo", "x86_64")], &[]);
        let json: serde_json::Value = serde_json::to_value(&config).unwrap();
        assert_eq!(json["created"], IMAGE_EPOCH);
        assert_eq!(json["rootfs"]["type"], "layers");
        assert_eq!(json["config"]["Cmd"][0], "/bin/sh");
        assert!(json.get("variant").is_none());
        assert!(json["config"].get("Entrypoint").is_none());
    }
}
