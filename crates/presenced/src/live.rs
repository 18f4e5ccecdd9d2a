//! Latest frame, latest preview and the status overlay, shared between the
//! capture loop and request handlers.

use presence_core::BoundingBox;
use presence_hw::Frame;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const IDLE_MESSAGE: &str = "Ready";

pub const COLOR_IDLE: [u8; 3] = [160, 160, 160];
pub const COLOR_SUCCESS: [u8; 3] = [40, 200, 80];
pub const COLOR_NOTICE: [u8; 3] = [60, 140, 230];
pub const COLOR_WARNING: [u8; 3] = [240, 170, 30];
pub const COLOR_ERROR: [u8; 3] = [220, 50, 50];

/// What the preview overlay currently shows.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub message: String,
    pub color: [u8; 3],
    pub matched_name: Option<String>,
    pub detection: Option<BoundingBox>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            message: IDLE_MESSAGE.to_string(),
            color: COLOR_IDLE,
            matched_name: None,
            detection: None,
        }
    }
}

struct Inner {
    raw_frame: Option<Frame>,
    preview_frame: Option<Vec<u8>>,
    status: StatusSnapshot,
    status_set_at: Option<Instant>,
    last_update: Option<Instant>,
}

/// Single lock-guarded state object. Readers always get copies.
pub struct LiveFrameState {
    inner: Mutex<Inner>,
    status_timeout: Duration,
}

impl LiveFrameState {
    pub fn new(status_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                raw_frame: None,
                preview_frame: None,
                status: StatusSnapshot::idle(),
                status_set_at: None,
                last_update: None,
            }),
            status_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the overlay status. It reverts to idle after the status timeout.
    pub fn set_status(&self, status: StatusSnapshot) {
        let mut inner = self.lock();
        inner.status = status;
        inner.status_set_at = Some(Instant::now());
    }

    /// Current overlay status, expiring a stale one first.
    pub fn status(&self) -> StatusSnapshot {
        let mut inner = self.lock();
        let expired = inner
            .status_set_at
            .is_some_and(|at| at.elapsed() >= self.status_timeout);
        if expired {
            inner.status = StatusSnapshot::idle();
            inner.status_set_at = None;
        }
        inner.status.clone()
    }

    /// Publish a raw frame and its preview together.
    pub fn publish(&self, raw_frame: Frame, preview_frame: Vec<u8>) {
        let mut inner = self.lock();
        inner.raw_frame = Some(raw_frame);
        inner.preview_frame = Some(preview_frame);
        inner.last_update = Some(Instant::now());
    }

    /// Copy of the latest raw frame, if it is no older than `max_age`.
    pub fn fresh_frame(&self, max_age: Duration) -> Option<Frame> {
        self.lock()
            .raw_frame
            .as_ref()
            .filter(|f| f.age() <= max_age)
            .cloned()
    }

    pub fn latest_preview(&self) -> Option<Vec<u8>> {
        self.lock().preview_frame.clone()
    }

    /// Time since the capture loop last published.
    pub fn last_update_age(&self) -> Option<Duration> {
        self.lock().last_update.map(|t| t.elapsed())
    }

    /// Drop published frames, e.g. when the camera is released.
    pub fn clear_frames(&self) {
        let mut inner = self.lock();
        inner.raw_frame = None;
        inner.preview_frame = None;
        inner.last_update = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::from_rgb(vec![1; 12], 2, 2, 7).unwrap()
    }

    fn busy_status() -> StatusSnapshot {
        StatusSnapshot {
            message: "Checked in: Ada".into(),
            color: COLOR_SUCCESS,
            matched_name: Some("Ada".into()),
            detection: Some(BoundingBox { x: 1.0, y: 2.0, width: 3.0, height: 4.0 }),
        }
    }

    #[test]
    fn test_starts_idle_and_empty() {
        let live = LiveFrameState::new(Duration::from_secs(3));
        assert_eq!(live.status(), StatusSnapshot::idle());
        assert!(live.fresh_frame(Duration::from_secs(1)).is_none());
        assert!(live.latest_preview().is_none());
        assert!(live.last_update_age().is_none());
    }

    #[test]
    fn test_publish_and_copy_out() {
        let live = LiveFrameState::new(Duration::from_secs(3));
        live.publish(frame(), vec![0xFF, 0xD8]);
        let f = live.fresh_frame(Duration::from_secs(5)).unwrap();
        assert_eq!(f.sequence, 7);
        assert_eq!(live.latest_preview().unwrap(), vec![0xFF, 0xD8]);
        assert!(live.last_update_age().is_some());
    }

    #[test]
    fn test_stale_frame_not_returned() {
        let live = LiveFrameState::new(Duration::from_secs(3));
        live.publish(frame(), vec![1]);
        std::thread::sleep(Duration::from_millis(30));
        assert!(live.fresh_frame(Duration::from_millis(5)).is_none());
        assert!(live.fresh_frame(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_status_expires_to_idle() {
        let live = LiveFrameState::new(Duration::from_millis(50));
        live.set_status(busy_status());
        assert_eq!(live.status(), busy_status());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(live.status(), StatusSnapshot::idle());
    }

    #[test]
    fn test_new_status_restarts_timer() {
        let live = LiveFrameState::new(Duration::from_millis(200));
        live.set_status(busy_status());
        std::thread::sleep(Duration::from_millis(120));
        live.set_status(busy_status());
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(live.status().matched_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_clear_frames_keeps_status() {
        let live = LiveFrameState::new(Duration::from_secs(3));
        live.publish(frame(), vec![1]);
        live.set_status(busy_status());
        live.clear_frames();
        assert!(live.fresh_frame(Duration::from_secs(5)).is_none());
        assert!(live.latest_preview().is_none());
        assert_eq!(live.status(), busy_status());
    }
}
