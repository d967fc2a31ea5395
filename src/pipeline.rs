//! Per-frame path run on the capture thread: Throttle → Normalizer →
//! Encoder → frame channel.
//!
//! Nothing here blocks. Per-frame failures drop the frame and are reported
//! on the debug channel; only a source-level `Ended` event finishes the
//! session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::bmp;
use crate::delivery::{EventDelivery, Publish};
use crate::error::Result;
use crate::frame::{EncodedImage, RawFrame};
use crate::ingest::{normalize, FrameHandler, SourceEvent};
use crate::session::Lifecycle;
use crate::throttle::FrameThrottle;

/// Counters shared between the capture thread and the session owner.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    admitted: AtomicU64,
    throttled: AtomicU64,
    encoded: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of `PipelineStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub received: u64,
    pub admitted: u64,
    pub throttled: u64,
    pub encoded: u64,
    /// Encoded frames that reached a subscriber.
    pub published: u64,
    /// Encoded frames discarded because the subscriber was still busy.
    pub dropped: u64,
    pub failed: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            received: self.received.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            encoded: self.encoded.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub(crate) struct FramePipeline {
    device_id: String,
    throttle: FrameThrottle,
    delivery: Arc<EventDelivery>,
    stats: Arc<PipelineStats>,
    lifecycle: Arc<Lifecycle>,
    generation: u64,
    /// Emit a progress line every this many encoded frames (0 disables).
    progress_every: u64,
    ended: bool,
}

impl FramePipeline {
    pub(crate) fn new(
        device_id: String,
        throttle: FrameThrottle,
        delivery: Arc<EventDelivery>,
        stats: Arc<PipelineStats>,
        lifecycle: Arc<Lifecycle>,
        generation: u64,
        progress_every: u64,
    ) -> Self {
        Self {
            device_id,
            throttle,
            delivery,
            stats,
            lifecycle,
            generation,
            progress_every,
            ended: false,
        }
    }

    pub(crate) fn into_handler(mut self) -> FrameHandler {
        Box::new(move |event| self.handle(event))
    }

    pub(crate) fn handle(&mut self, event: SourceEvent<'_>) {
        match event {
            SourceEvent::Frame(frame) => self.on_frame(&frame),
            SourceEvent::Ended { reason } => self.on_end(&reason),
        }
    }

    fn on_frame(&mut self, frame: &RawFrame<'_>) {
        if self.ended {
            return;
        }
        PipelineStats::bump(&self.stats.received);
        if !self.throttle.admit(frame.timestamp) {
            PipelineStats::bump(&self.stats.throttled);
            return;
        }
        PipelineStats::bump(&self.stats.admitted);

        let image = match encode(frame) {
            Ok(image) => image,
            Err(err) => {
                PipelineStats::bump(&self.stats.failed);
                log::warn!("FramePipeline: dropped frame from {}: {}", self.device_id, err);
                self.delivery
                    .debug()
                    .log(format!("frame dropped ({}): {}", err.code(), err));
                return;
            }
        };

        let encoded = PipelineStats::bump(&self.stats.encoded);
        let len = image.len();
        match self.delivery.frames().publish(image) {
            Publish::Posted => {
                PipelineStats::bump(&self.stats.published);
            }
            Publish::Dropped => {
                PipelineStats::bump(&self.stats.dropped);
            }
            Publish::NoSubscriber => {}
        }
        if self.progress_every > 0 && encoded % self.progress_every == 0 {
            self.delivery
                .debug()
                .log(format!("frame #{} ({} bytes)", encoded, len));
        }
    }

    fn on_end(&mut self, reason: &str) {
        if self.ended {
            return;
        }
        self.ended = true;
        if self.lifecycle.source_ended(self.generation) {
            log::warn!("FramePipeline: {} stopped producing: {}", self.device_id, reason);
            self.delivery
                .debug()
                .log(format!("capture ended: {}", reason));
        }
    }
}

fn encode(frame: &RawFrame<'_>) -> Result<EncodedImage> {
    let raster = normalize(frame)?;
    bmp::encode(&raster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::session::SessionState;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        pipeline: FramePipeline,
        stats: Arc<PipelineStats>,
        frames: Arc<Mutex<Vec<EncodedImage>>>,
        lines: Arc<Mutex<Vec<String>>>,
        lifecycle: Arc<Lifecycle>,
    }

    fn harness(fps: u32, progress_every: u64) -> Harness {
        let delivery = Arc::new(EventDelivery::inline());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        delivery
            .frames()
            .subscribe(move |image| sink.lock().unwrap().push(image));
        let sink = lines.clone();
        delivery
            .debug()
            .subscribe(move |line| sink.lock().unwrap().push(line));
        lines.lock().unwrap().clear();

        let lifecycle = Arc::new(Lifecycle::default());
        let generation = lifecycle.begin_start();
        assert!(lifecycle.mark_running(generation));

        let stats = Arc::new(PipelineStats::default());
        let pipeline = FramePipeline::new(
            "stub://test".to_string(),
            FrameThrottle::from_fps(fps),
            delivery,
            stats.clone(),
            lifecycle.clone(),
            generation,
            progress_every,
        );
        Harness {
            pipeline,
            stats,
            frames,
            lines,
            lifecycle,
        }
    }

    fn feed(pipeline: &mut FramePipeline, format: PixelFormat, data: &[u8], at_ms: u64) {
        pipeline.handle(SourceEvent::Frame(RawFrame::new(
            2,
            2,
            format,
            data,
            Duration::from_millis(at_ms),
        )));
    }

    #[test]
    fn throttles_before_encoding() {
        let mut h = harness(15, 0);
        let rgb = [10u8; 12];
        for at in [0, 10, 67, 100, 200] {
            feed(&mut h.pipeline, PixelFormat::Rgb24, &rgb, at);
        }

        let stats = h.stats.snapshot();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.admitted, 3);
        assert_eq!(stats.throttled, 2);
        assert_eq!(stats.encoded, 3);
        assert_eq!(stats.published, 3);
        assert_eq!(h.frames.lock().unwrap().len(), 3);
        assert_eq!(h.frames.lock().unwrap()[0].len(), bmp::encoded_len(2, 2));
    }

    #[test]
    fn bad_frame_is_dropped_and_session_survives() {
        let mut h = harness(1000, 0);
        feed(&mut h.pipeline, PixelFormat::Rgb24, &[0u8; 5], 0);
        feed(&mut h.pipeline, PixelFormat::Other(0x4750_4a4d), &[0u8; 12], 10);
        feed(&mut h.pipeline, PixelFormat::Rgb24, &[0u8; 12], 20);

        let stats = h.stats.snapshot();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.encoded, 1);
        assert_eq!(h.lifecycle.state(), SessionState::Running);

        let lines = h.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("MALFORMED_FRAME"), "{}", lines[0]);
        assert!(lines[1].contains("UNSUPPORTED_FORMAT"), "{}", lines[1]);
    }

    #[test]
    fn reports_progress_every_n_encoded_frames() {
        let mut h = harness(1000, 2);
        for at in 0..5 {
            feed(&mut h.pipeline, PixelFormat::Rgb24, &[0u8; 12], at * 10);
        }
        let lines = h.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("frame #2 (70 bytes)"), "{}", lines[0]);
        assert!(lines[1].ends_with("frame #4 (70 bytes)"), "{}", lines[1]);
    }

    #[test]
    fn unsubscribed_frames_are_encoded_then_discarded() {
        let h = harness(1000, 0);
        let mut pipeline = h.pipeline;
        pipeline.delivery.frames().unsubscribe();
        feed(&mut pipeline, PixelFormat::Rgb24, &[0u8; 12], 0);

        let stats = h.stats.snapshot();
        assert_eq!(stats.encoded, 1);
        assert_eq!(stats.published, 0);
        assert!(h.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn busy_subscriber_drops_frames_instead_of_queueing() {
        use crate::delivery::{DeliveryContext, FRAME_BACKLOG};
        use std::sync::mpsc;

        let context = DeliveryContext::dedicated("pipeline-busy").unwrap();
        let delivery = Arc::new(EventDelivery::new(context));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        delivery.frames().subscribe(move |_| {
            let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
        });

        let lifecycle = Arc::new(Lifecycle::default());
        let generation = lifecycle.begin_start();
        let stats = Arc::new(PipelineStats::default());
        let mut pipeline = FramePipeline::new(
            "stub://busy".to_string(),
            FrameThrottle::from_fps(1000),
            delivery.clone(),
            stats.clone(),
            lifecycle,
            generation,
            0,
        );
        for at in 0..10 {
            feed(&mut pipeline, PixelFormat::Rgb24, &[0u8; 12], at * 10);
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.encoded, 10);
        assert_eq!(snapshot.published, FRAME_BACKLOG as u64);
        assert_eq!(snapshot.dropped, 10 - FRAME_BACKLOG as u64);

        for _ in 0..FRAME_BACKLOG {
            gate_tx.send(()).unwrap();
        }
        delivery.flush();
        assert_eq!(delivery.frames().pending(), 0);
    }

    #[test]
    fn source_end_is_reported_once_and_idles_the_session() {
        let mut h = harness(15, 0);
        h.pipeline.handle(SourceEvent::Ended {
            reason: "device unplugged".to_string(),
        });
        h.pipeline.handle(SourceEvent::Ended {
            reason: "again".to_string(),
        });
        feed(&mut h.pipeline, PixelFormat::Rgb24, &[0u8; 12], 0);

        assert_eq!(h.lifecycle.state(), SessionState::Idle);
        let lines = h.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("capture ended: device unplugged"));
        assert_eq!(h.stats.snapshot().received, 0);
    }
}
