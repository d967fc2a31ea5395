use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::catalog::{CatalogFilter, DEFAULT_VENDOR_ID};
use crate::ingest::STUB_SCHEME;
use crate::session::CaptureConfig;

const DEFAULT_FPS: u32 = 15;
const DEFAULT_WIDTH: u32 = 256;
const DEFAULT_HEIGHT: u32 = 64;
const DEFAULT_NAME_HINT: &str = "disting";
const DEFAULT_PERMISSION_RETRIES: u32 = 2;
const DEFAULT_PERMISSION_BACKOFF_MS: u64 = 100;
const MAX_FPS: u32 = 120;
const MAX_PERMISSION_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    default_device: Option<String>,
    capture: Option<CaptureConfigFile>,
    catalog: Option<CatalogConfigFile>,
    permission: Option<PermissionConfigFile>,
    delivery: Option<DeliveryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogConfigFile {
    vendor_id: Option<u16>,
    name_hints: Option<Vec<String>>,
    stub_devices: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct PermissionConfigFile {
    retries: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    dedicated_thread: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Device streamed when a command names none.
    pub default_device: Option<String>,
    pub capture: CaptureSettings,
    pub catalog: CatalogSettings,
    pub permission: PermissionSettings,
    /// Run subscriber handlers on a dedicated delivery thread instead of
    /// the capture thread.
    pub dedicated_delivery: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub vendor_id: u16,
    pub name_hints: Vec<String>,
    /// `stub://` test-pattern devices to register in the catalog.
    pub stub_devices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PermissionSettings {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        // An empty file section falls back to defaults and cannot fail.
        Self::from_file(BridgeConfigFile::default())
    }
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("UVC_BRIDGE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let catalog = file.catalog.unwrap_or_default();
        let permission = file.permission.unwrap_or_default();
        Self {
            default_device: file.default_device.filter(|id| !id.trim().is_empty()),
            capture: CaptureSettings {
                target_fps: capture.target_fps.unwrap_or(DEFAULT_FPS),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
            },
            catalog: CatalogSettings {
                vendor_id: catalog.vendor_id.unwrap_or(DEFAULT_VENDOR_ID),
                name_hints: catalog
                    .name_hints
                    .unwrap_or_else(|| vec![DEFAULT_NAME_HINT.to_string()]),
                stub_devices: catalog.stub_devices.unwrap_or_default(),
            },
            permission: PermissionSettings {
                retries: permission.retries.unwrap_or(DEFAULT_PERMISSION_RETRIES),
                backoff: Duration::from_millis(
                    permission
                        .backoff_ms
                        .unwrap_or(DEFAULT_PERMISSION_BACKOFF_MS),
                ),
            },
            dedicated_delivery: file
                .delivery
                .and_then(|delivery| delivery.dedicated_thread)
                .unwrap_or(true),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("UVC_BRIDGE_DEVICE") {
            if !device.trim().is_empty() {
                self.default_device = Some(device.trim().to_string());
            }
        }
        if let Ok(fps) = std::env::var("UVC_BRIDGE_FPS") {
            self.capture.target_fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_BRIDGE_FPS must be an integer frame rate"))?;
        }
        if let Ok(width) = std::env::var("UVC_BRIDGE_WIDTH") {
            self.capture.width = width
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_BRIDGE_WIDTH must be an integer pixel count"))?;
        }
        if let Ok(height) = std::env::var("UVC_BRIDGE_HEIGHT") {
            self.capture.height = height
                .trim()
                .parse()
                .map_err(|_| anyhow!("UVC_BRIDGE_HEIGHT must be an integer pixel count"))?;
        }
        if let Ok(vendor) = std::env::var("UVC_BRIDGE_VENDOR_ID") {
            self.catalog.vendor_id = parse_vendor_id(&vendor)?;
        }
        if let Ok(hints) = std::env::var("UVC_BRIDGE_NAME_HINTS") {
            self.catalog.name_hints = split_csv(&hints);
        }
        if let Ok(stubs) = std::env::var("UVC_BRIDGE_STUB_DEVICES") {
            let parsed = split_csv(&stubs);
            if !parsed.is_empty() {
                self.catalog.stub_devices = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(1..=MAX_FPS).contains(&self.capture.target_fps) {
            return Err(anyhow!(
                "target_fps must be between 1 and {} (got {})",
                MAX_FPS,
                self.capture.target_fps
            ));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.permission.backoff > MAX_PERMISSION_BACKOFF {
            return Err(anyhow!(
                "permission backoff must not exceed {}ms",
                MAX_PERMISSION_BACKOFF.as_millis()
            ));
        }
        if let Some(stub) = self
            .catalog
            .stub_devices
            .iter()
            .find(|id| !id.starts_with(STUB_SCHEME))
        {
            return Err(anyhow!("stub device '{}' must start with {}", stub, STUB_SCHEME));
        }

        // A stub default device is registered implicitly.
        if let Some(device) = &self.default_device {
            if device.starts_with(STUB_SCHEME) && !self.catalog.stub_devices.contains(device) {
                self.catalog.stub_devices.push(device.clone());
            }
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            target_fps: self.capture.target_fps,
            width: self.capture.width,
            height: self.capture.height,
            permission_retries: self.permission.retries,
            permission_backoff: self.permission.backoff,
        }
    }

    pub fn catalog_filter(&self) -> CatalogFilter {
        CatalogFilter {
            vendor_id: self.catalog.vendor_id,
            name_hints: self.catalog.name_hints.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_vendor_id(value: &str) -> Result<u16> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| anyhow!("UVC_BRIDGE_VENDOR_ID must be a 16-bit id, decimal or 0x hex"))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_capture_config() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.capture_config(), CaptureConfig::default());
        assert_eq!(cfg.catalog_filter(), CatalogFilter::default());
        assert!(cfg.dedicated_delivery);
    }

    #[test]
    fn parses_vendor_ids() {
        assert_eq!(parse_vendor_id("0x16C0").unwrap(), 0x16c0);
        assert_eq!(parse_vendor_id("5824").unwrap(), 0x16c0);
        assert!(parse_vendor_id("0x1FFFF").is_err());
        assert!(parse_vendor_id("disting").is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_fps() {
        let mut cfg = BridgeConfig::default();
        cfg.capture.target_fps = 0;
        assert!(cfg.validate().is_err());
        cfg.capture.target_fps = 121;
        assert!(cfg.validate().is_err());
        cfg.capture.target_fps = 30;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stub_default_device_is_registered() {
        let mut cfg = BridgeConfig::default();
        cfg.default_device = Some("stub://demo".to_string());
        cfg.validate().unwrap();
        assert_eq!(cfg.catalog.stub_devices, vec!["stub://demo"]);
        cfg.validate().unwrap();
        assert_eq!(cfg.catalog.stub_devices.len(), 1);
    }
}
