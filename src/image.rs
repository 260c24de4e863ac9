//! Target image allocation and image metadata capture.

use std::path::Path;

use anyhow::{format_err, Error, Result};
use log::debug;
use serde_json::Value;

use crate::tools::run_command;

/// qcow2 creation options recovered from a backup's sidecar file.
///
/// Every field falls back silently to the tool default when the sidecar
/// misses the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QcowOptions {
    pub compat: Option<String>,
    pub cluster_size: Option<u64>,
    pub lazy_refcounts: Option<bool>,
}

impl QcowOptions {
    /// Pick the supported keys out of a verbatim `qemu-img info` JSON.
    pub fn from_sidecar(info: &Value) -> Self {
        QcowOptions {
            compat: info["format-specific"]["data"]["compat"]
                .as_str()
                .map(String::from),
            cluster_size: info["cluster-size"].as_u64(),
            lazy_refcounts: info["format-specific"]["data"]["lazy-refcounts"].as_bool(),
        }
    }

    fn to_arg(&self) -> Option<String> {
        let mut opts = Vec::new();
        if let Some(compat) = &self.compat {
            opts.push(format!("compat={}", compat));
        }
        if let Some(cluster_size) = self.cluster_size {
            opts.push(format!("cluster_size={}", cluster_size));
        }
        if let Some(lazy_refcounts) = self.lazy_refcounts {
            opts.push(format!("lazy_refcounts={}", if lazy_refcounts { "on" } else { "off" }));
        }
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(","))
        }
    }
}

/// Allocates restore targets.
pub trait ImageCreator {
    fn create(&self, path: &Path, format: &str, size: u64, options: &QcowOptions) -> Result<()>;
}

/// `qemu-img create` based creator, the default.
#[derive(Debug, Default)]
pub struct QemuImageCreator;

impl ImageCreator for QemuImageCreator {
    fn create(&self, path: &Path, format: &str, size: u64, options: &QcowOptions) -> Result<()> {
        let mut command = std::process::Command::new("qemu-img");
        command.arg("create").arg("-f").arg(format);
        if format == "qcow2" {
            if let Some(arg) = options.to_arg() {
                command.arg("-o").arg(arg);
            }
        }
        command.arg(path).arg(size.to_string());
        let output = run_command(command)?;
        debug!("created image {}: {}", path.display(), output.trim());
        Ok(())
    }
}

/// Verbatim `qemu-img info --output json`, as stored in the sidecar
/// file.
pub fn image_info_text(path: &Path) -> Result<String, Error> {
    let mut command = std::process::Command::new("qemu-img");
    command.arg("info").arg("--output=json").arg(path);
    run_command(command)
}

/// Parsed image info.
pub fn image_info(path: &Path) -> Result<Value, Error> {
    let output = image_info_text(path)?;
    serde_json::from_str(&output)
        .map_err(|err| format_err!("unable to parse qemu-img info output: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sidecar_keys_are_optional() {
        let opts = QcowOptions::from_sidecar(&json!({}));
        assert_eq!(opts, QcowOptions::default());
        assert_eq!(opts.to_arg(), None);
    }

    #[test]
    fn sidecar_keys_are_honored() {
        let info = json!({
            "cluster-size": 65536,
            "format-specific": {
                "type": "qcow2",
                "data": { "compat": "1.1", "lazy-refcounts": true }
            }
        });
        let opts = QcowOptions::from_sidecar(&info);
        assert_eq!(opts.compat.as_deref(), Some("1.1"));
        assert_eq!(opts.cluster_size, Some(65536));
        assert_eq!(opts.lazy_refcounts, Some(true));
        assert_eq!(
            opts.to_arg().unwrap(),
            "compat=1.1,cluster_size=65536,lazy_refcounts=on"
        );
    }
}
