//! Linux device registry backed by `/sys/class/video4linux`.
//!
//! Each `videoN` node with sysfs `index` 0 is a capture interface (UVC
//! exposes a second metadata node per camera with index 1, which is
//! skipped). Vendor and product ids come from the first ancestor of the
//! node's `device` link that carries `idVendor`/`idProduct`.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{DeviceClass, DeviceRegistry, PermissionState, RegistryEntry};

const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";
const DEV_ROOT: &str = "/dev";
const MAX_PARENT_WALK: usize = 5;

#[derive(Clone, Debug)]
pub struct SysfsRegistry {
    class_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsRegistry {
    pub fn new() -> Self {
        Self::with_roots(SYSFS_VIDEO4LINUX, DEV_ROOT)
    }

    /// Registry rooted elsewhere, for containers and tests.
    pub fn with_roots(class_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            class_root: class_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn node_name<'a>(&self, id: &'a str) -> Option<&'a str> {
        Path::new(id)
            .strip_prefix(&self.dev_root)
            .ok()
            .and_then(|rest| rest.to_str())
            .filter(|name| name.starts_with("video"))
    }

    fn read_entry(&self, node: &str) -> Option<RegistryEntry> {
        let node_dir = self.class_root.join(node);
        let index = read_trimmed(&node_dir.join("index"))
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        if index != 0 {
            log::debug!("SysfsRegistry: skipping {} (index {})", node, index);
            return None;
        }

        let name = read_trimmed(&node_dir.join("name")).unwrap_or_else(|| node.to_string());
        let (vendor_id, product_id) = match usb_ids(&node_dir.join("device")) {
            Some((vendor, product)) => (Some(vendor), Some(product)),
            None => (None, None),
        };

        Some(RegistryEntry {
            id: self.dev_root.join(node).to_string_lossy().into_owned(),
            name,
            class: DeviceClass::VideoCapture,
            vendor_id,
            product_id,
        })
    }
}

impl DeviceRegistry for SysfsRegistry {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn entries(&self) -> Vec<RegistryEntry> {
        let dir = match fs::read_dir(&self.class_root) {
            Ok(dir) => dir,
            Err(err) => {
                log::debug!(
                    "SysfsRegistry: cannot read {}: {}",
                    self.class_root.display(),
                    err
                );
                return Vec::new();
            }
        };

        let mut nodes: Vec<String> = dir
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("video"))
            .collect();
        nodes.sort_by_key(|name| {
            name.trim_start_matches("video")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        });

        nodes
            .iter()
            .filter_map(|node| self.read_entry(node))
            .collect()
    }

    fn permission(&self, id: &str) -> PermissionState {
        if self.node_name(id).is_none() {
            return PermissionState::Denied;
        }
        match OpenOptions::new().read(true).write(true).open(id) {
            Ok(_) => PermissionState::Granted,
            Err(err) => {
                if err.kind() != ErrorKind::PermissionDenied {
                    log::debug!("SysfsRegistry: cannot open {}: {}", id, err);
                }
                PermissionState::Denied
            }
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn usb_ids(device_link: &Path) -> Option<(u16, u16)> {
    let mut path = fs::canonicalize(device_link).ok()?;
    for _ in 0..MAX_PARENT_WALK {
        let vendor = read_trimmed(&path.join("idVendor"));
        let product = read_trimmed(&path.join("idProduct"));
        if let (Some(vendor), Some(product)) = (vendor, product) {
            let vendor = u16::from_str_radix(&vendor, 16).ok()?;
            let product = u16::from_str_radix(&product, 16).ok()?;
            return Some((vendor, product));
        }
        if !path.pop() {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Builds class/videoN entries whose `device` link points into a fake USB tree.
    fn fake_tree() -> Result<(TempDir, SysfsRegistry)> {
        let root = TempDir::new()?;
        let class = root.path().join("class");
        let dev = root.path().join("dev");
        let usb = root.path().join("devices/usb1/1-2");
        let iface = usb.join("1-2:1.0");
        fs::create_dir_all(&iface)?;
        write(&usb.join("idVendor"), "16c0\n")?;
        write(&usb.join("idProduct"), "05df\n")?;

        for (node, index, name) in [
            ("video0", "0", "disting NT"),
            ("video1", "1", "disting NT"),
            ("video2", "0", "Integrated Camera"),
        ] {
            let dir = class.join(node);
            fs::create_dir_all(&dir)?;
            write(&dir.join("index"), index)?;
            write(&dir.join("name"), name)?;
            write(&dev.join(node), "")?;
        }
        std::os::unix::fs::symlink(&iface, class.join("video0/device"))?;
        std::os::unix::fs::symlink(&iface, class.join("video1/device"))?;

        Ok((root, SysfsRegistry::with_roots(class, dev)))
    }

    #[test]
    fn enumerates_capture_nodes_with_usb_ids() -> Result<()> {
        let (_root, registry) = fake_tree()?;
        let entries = registry.entries();

        assert_eq!(entries.len(), 2, "metadata node must be skipped");
        assert!(entries[0].id.ends_with("video0"));
        assert_eq!(entries[0].name, "disting NT");
        assert_eq!(entries[0].vendor_id, Some(0x16c0));
        assert_eq!(entries[0].product_id, Some(0x05df));
        assert!(entries[1].id.ends_with("video2"));
        assert_eq!(entries[1].vendor_id, None);
        Ok(())
    }

    #[test]
    fn permission_reflects_node_access() -> Result<()> {
        let (_root, registry) = fake_tree()?;
        let entries = registry.entries();
        assert_eq!(registry.permission(&entries[0].id), PermissionState::Granted);
        assert_eq!(registry.permission("/etc/passwd"), PermissionState::Denied);
        Ok(())
    }

    #[test]
    fn missing_class_root_yields_no_devices() {
        let registry = SysfsRegistry::with_roots("/nonexistent/video4linux", "/dev");
        assert!(registry.entries().is_empty());
    }
}
