//! Command and event surface consumed by a UI or control layer.
//!
//! Every command returns synchronously. Commands are serialized through one
//! lock around the capture session, so a `start_stream` racing a
//! `stop_stream` from another thread never leaves two bindings alive.
//! Debug lines from a command are published after that lock is released,
//! and `state` never takes it, so an inline debug handler may query the
//! bridge. Handlers must not issue `start_stream`/`stop_stream` themselves.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::catalog::{DeviceCatalog, DeviceDescriptor, MemoryRegistry, PermissionState};
use crate::config::BridgeConfig;
use crate::delivery::{DeliveryContext, EventDelivery, SubscriptionId};
use crate::error::{BridgeError, Result};
use crate::frame::EncodedImage;
use crate::ingest::{FrameSourceProvider, PlatformSources};
use crate::pipeline::SessionStats;
use crate::session::{CaptureConfig, CaptureSession, Lifecycle, SessionState};

const DELIVERY_THREAD_NAME: &str = "uvc-delivery";

pub struct UsbVideoBridge {
    catalog: Arc<DeviceCatalog>,
    sources: Arc<dyn FrameSourceProvider>,
    delivery: Arc<EventDelivery>,
    lifecycle: Arc<Lifecycle>,
    session: Mutex<CaptureSession>,
}

impl UsbVideoBridge {
    pub fn new(
        catalog: Arc<DeviceCatalog>,
        sources: Arc<dyn FrameSourceProvider>,
        delivery: Arc<EventDelivery>,
        config: CaptureConfig,
    ) -> Self {
        let session = CaptureSession::new(
            catalog.clone(),
            sources.clone(),
            delivery.clone(),
            config,
        );
        Self {
            catalog,
            sources,
            delivery,
            lifecycle: session.lifecycle(),
            session: Mutex::new(session),
        }
    }

    /// Builds a bridge over the platform registry, any configured
    /// `stub://` devices and the platform frame sources.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        #[allow(unused_mut)]
        let mut catalog = DeviceCatalog::new(config.catalog_filter());
        #[cfg(target_os = "linux")]
        catalog.add_registry(Arc::new(crate::catalog::SysfsRegistry::new()));

        if !config.catalog.stub_devices.is_empty() {
            let stubs = MemoryRegistry::new();
            for id in &config.catalog.stub_devices {
                stubs.insert_stub(id, &stub_display_name(id));
            }
            catalog.add_registry(Arc::new(stubs));
        }

        let context = if config.dedicated_delivery {
            DeliveryContext::dedicated(DELIVERY_THREAD_NAME).map_err(|err| {
                BridgeError::Config(format!("cannot spawn delivery thread: {}", err))
            })?
        } else {
            DeliveryContext::Inline
        };

        Ok(Self::new(
            Arc::new(catalog),
            Arc::new(PlatformSources),
            Arc::new(EventDelivery::new(context)),
            config.capture_config(),
        ))
    }

    pub fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.catalog.enumerate()
    }

    pub fn request_permission(&self, device_id: &str) -> Result<PermissionState> {
        self.catalog.request_permission(device_id)
    }

    /// Starts streaming from `device_id`, stopping any current stream first.
    pub fn start_stream(&self, device_id: &str, target_fps: Option<u32>) -> Result<()> {
        let (result, notices) = self.lock_session().start_deferred(device_id, target_fps);
        notices.publish();
        result
    }

    pub fn stop_stream(&self) {
        let notices = self.lock_session().stop_deferred();
        notices.publish();
    }

    /// Whether hardware capture is available in this build on this platform.
    /// `stub://` devices work regardless.
    pub fn is_supported(&self) -> bool {
        self.sources.is_supported()
    }

    /// Replaces the frame subscriber. Does not affect the capture session.
    pub fn subscribe_frames<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EncodedImage) + Send + Sync + 'static,
    {
        self.delivery.frames().subscribe(handler)
    }

    pub fn unsubscribe_frames(&self) {
        self.delivery.frames().unsubscribe();
    }

    pub fn subscribe_debug<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.delivery.debug().subscribe(handler)
    }

    pub fn unsubscribe_debug(&self) {
        self.delivery.debug().unsubscribe();
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.lock_session().stats()
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_session().last_error().map(str::to_string)
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    /// Waits for events already handed to the delivery thread.
    pub fn flush_events(&self) {
        self.delivery.flush();
    }

    fn lock_session(&self) -> MutexGuard<'_, CaptureSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stub_display_name(id: &str) -> String {
    let name = id
        .trim_start_matches(crate::ingest::STUB_SCHEME)
        .split('?')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("stub");
    format!("Test Pattern ({})", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(devices: &[&str]) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.catalog.stub_devices = devices.iter().map(|id| id.to_string()).collect();
        config.dedicated_delivery = false;
        config
    }

    #[test]
    fn stub_devices_are_listed_and_granted() -> Result<()> {
        let bridge = UsbVideoBridge::from_config(&stub_config(&["stub://cam?fps=60"]))?;
        let device = bridge
            .list_devices()
            .into_iter()
            .find(|device| device.id == "stub://cam?fps=60")
            .ok_or_else(|| BridgeError::DeviceNotFound("stub://cam?fps=60".into()))?;
        assert_eq!(device.name, "Test Pattern (cam)");
        assert_eq!(device.permission, PermissionState::Granted);
        assert_eq!(
            bridge.request_permission("stub://cam?fps=60")?,
            PermissionState::Granted
        );
        Ok(())
    }

    #[test]
    fn unknown_device_fails_start_and_stays_idle() -> Result<()> {
        let bridge = UsbVideoBridge::from_config(&stub_config(&[]))?;
        let err = bridge.start_stream("stub://missing", None).unwrap_err();
        assert_eq!(err.code(), "DEVICE_NOT_FOUND");
        assert_eq!(bridge.state(), SessionState::Idle);
        assert!(bridge.last_error().is_some());
        bridge.stop_stream();
        assert_eq!(bridge.state(), SessionState::Idle);
        Ok(())
    }

    #[test]
    fn inline_debug_handler_can_query_state() -> Result<()> {
        let bridge = Arc::new(UsbVideoBridge::from_config(&stub_config(&["stub://cam?fps=5"]))?);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let weak = Arc::downgrade(&bridge);
        bridge.subscribe_debug(move |line| {
            if let Some(bridge) = weak.upgrade() {
                sink.lock().unwrap().push((line, bridge.state()));
            }
        });

        bridge.start_stream("stub://cam?fps=5", None)?;
        bridge.stop_stream();
        assert!(bridge.start_stream("stub://missing", None).is_err());

        let seen = seen.lock().unwrap();
        let state_for = |needle: &str| {
            seen.iter()
                .find(|(line, _)| line.contains(needle))
                .map(|(_, state)| *state)
        };
        assert_eq!(state_for("capture started on"), Some(SessionState::Running));
        assert_eq!(state_for("capture stopped on"), Some(SessionState::Idle));
        assert_eq!(state_for("DEVICE_NOT_FOUND"), Some(SessionState::Idle));
        Ok(())
    }

    #[test]
    fn streams_from_a_stub_device() -> Result<()> {
        let bridge = UsbVideoBridge::from_config(&stub_config(&["stub://cam?fps=100"]))?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        bridge.subscribe_frames(move |image| sink.lock().unwrap().push(image.len()));

        bridge.start_stream("stub://cam?fps=100", Some(50))?;
        assert_eq!(bridge.state(), SessionState::Running);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while frames.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        bridge.stop_stream();
        assert_eq!(bridge.state(), SessionState::Idle);

        let frames = frames.lock().unwrap();
        assert!(frames.len() >= 3);
        assert!(frames.iter().all(|len| *len == crate::bmp::encoded_len(256, 64)));
        Ok(())
    }
}
