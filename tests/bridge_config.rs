use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use uvc_frame_bridge::config::BridgeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "UVC_BRIDGE_CONFIG",
        "UVC_BRIDGE_DEVICE",
        "UVC_BRIDGE_FPS",
        "UVC_BRIDGE_WIDTH",
        "UVC_BRIDGE_HEIGHT",
        "UVC_BRIDGE_VENDOR_ID",
        "UVC_BRIDGE_NAME_HINTS",
        "UVC_BRIDGE_STUB_DEVICES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = BridgeConfig::load().expect("load config");
    assert_eq!(cfg.default_device, None);
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!((cfg.capture.width, cfg.capture.height), (256, 64));
    assert_eq!(cfg.catalog.vendor_id, 0x16C0);
    assert_eq!(cfg.catalog.name_hints, vec!["disting"]);
    assert!(cfg.catalog.stub_devices.is_empty());
    assert_eq!(cfg.permission.retries, 2);
    assert_eq!(cfg.permission.backoff, Duration::from_millis(100));
    assert!(cfg.dedicated_delivery);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "default_device": "/dev/video2",
        "capture": {
            "target_fps": 30,
            "width": 320,
            "height": 240
        },
        "catalog": {
            "vendor_id": 1133,
            "name_hints": ["brio"]
        },
        "permission": {
            "retries": 5,
            "backoff_ms": 250
        },
        "delivery": {
            "dedicated_thread": false
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("UVC_BRIDGE_CONFIG", file.path());
    std::env::set_var("UVC_BRIDGE_FPS", "10");
    std::env::set_var("UVC_BRIDGE_VENDOR_ID", "0x16C0");
    std::env::set_var("UVC_BRIDGE_NAME_HINTS", "disting, expert sleepers ,");

    let cfg = BridgeConfig::load().expect("load config");

    assert_eq!(cfg.default_device.as_deref(), Some("/dev/video2"));
    assert_eq!(cfg.capture.target_fps, 10);
    assert_eq!(cfg.capture.width, 320);
    assert_eq!(cfg.capture.height, 240);
    assert_eq!(cfg.catalog.vendor_id, 0x16C0);
    assert_eq!(cfg.catalog.name_hints, vec!["disting", "expert sleepers"]);
    assert_eq!(cfg.permission.retries, 5);
    assert_eq!(cfg.permission.backoff, Duration::from_millis(250));
    assert!(!cfg.dedicated_delivery);

    let capture = cfg.capture_config();
    assert_eq!(capture.target_fps, 10);
    assert_eq!(capture.permission_retries, 5);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
default_device = "stub://demo?fps=30"

[capture]
target_fps = 20

[catalog]
vendor_id = 0x046d
stub_devices = ["stub://bench?format=yuyv"]
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("UVC_BRIDGE_CONFIG", file.path());

    let cfg = BridgeConfig::load().expect("load config");
    assert_eq!(cfg.capture.target_fps, 20);
    assert_eq!(cfg.catalog.vendor_id, 0x046d);
    assert_eq!(
        cfg.catalog.stub_devices,
        vec!["stub://bench?format=yuyv", "stub://demo?fps=30"]
    );

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("UVC_BRIDGE_FPS", "fast");
    let err = BridgeConfig::load().unwrap_err();
    assert!(err.to_string().contains("UVC_BRIDGE_FPS"), "{err}");

    std::env::set_var("UVC_BRIDGE_FPS", "240");
    let err = BridgeConfig::load().unwrap_err();
    assert!(err.to_string().contains("target_fps"), "{err}");
    std::env::remove_var("UVC_BRIDGE_FPS");

    std::env::set_var("UVC_BRIDGE_STUB_DEVICES", "/dev/video0");
    let err = BridgeConfig::load().unwrap_err();
    assert!(err.to_string().contains("stub://"), "{err}");
    std::env::remove_var("UVC_BRIDGE_STUB_DEVICES");

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("UVC_BRIDGE_CONFIG", file.path());
    let err = BridgeConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"), "{err}");

    clear_env();
}
