//! Background capture loop: pulls frames from the held camera, renders the
//! annotated preview and publishes both to [`LiveFrameState`].

use crate::live::LiveFrameState;
use presence_hw::{CameraController, Overlay, PreviewRenderer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub idle_backoff: Duration,
    pub read_backoff: Duration,
}

/// What one iteration did, so the loop knows how long to wait.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Idle,
    ReadFailed,
    Published,
    RenderFailed,
}

/// Handle to the capture thread. Runs until [`CaptureLoop::shutdown`].
pub struct CaptureLoop {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureLoop {
    pub fn spawn(
        camera: Arc<CameraController>,
        live: Arc<LiveFrameState>,
        renderer: Arc<PreviewRenderer>,
        settings: CaptureSettings,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("presence-capture".into())
            .spawn(move || {
                tracing::info!("capture loop started");
                run(&camera, &live, &renderer, settings, &thread_stop);
                tracing::info!("capture loop exiting");
            })?;

        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked during shutdown");
            }
        }
    }
}

fn run(
    camera: &CameraController,
    live: &LiveFrameState,
    renderer: &PreviewRenderer,
    settings: CaptureSettings,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| step(camera, live, renderer)));
        match outcome {
            Ok(Step::Published) => {}
            Ok(Step::Idle) => std::thread::sleep(settings.idle_backoff),
            Ok(Step::ReadFailed) | Ok(Step::RenderFailed) => {
                std::thread::sleep(settings.read_backoff)
            }
            Err(_) => {
                tracing::error!("capture iteration panicked; continuing");
                std::thread::sleep(settings.read_backoff);
            }
        }
    }
}

fn step(camera: &CameraController, live: &LiveFrameState, renderer: &PreviewRenderer) -> Step {
    if !camera.is_started() {
        return Step::Idle;
    }

    let frame = match camera.read_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "frame read failed");
            return Step::ReadFailed;
        }
    };

    let status = live.status();
    let overlay = Overlay {
        text: &status.message,
        color: status.color,
        detection: status.detection,
    };

    match renderer.render(&frame, &overlay) {
        Ok(preview) => {
            tracing::trace!(sequence = frame.sequence, bytes = preview.len(), "frame published");
            live.publish(frame, preview);
            Step::Published
        }
        Err(e) => {
            tracing::warn!(error = %e, "preview render failed; frame dropped");
            Step::RenderFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_hw::camera::TestPatternBackend;
    use presence_hw::Candidate;
    use std::time::Instant;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            idle_backoff: Duration::from_millis(5),
            read_backoff: Duration::from_millis(5),
        }
    }

    fn test_camera() -> Arc<CameraController> {
        let backend = Arc::new(TestPatternBackend { width: 64, height: 48 });
        Arc::new(CameraController::new(vec![Candidate::new(0, backend)]))
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_step_idle_without_camera() {
        let camera = test_camera();
        let live = LiveFrameState::new(Duration::from_secs(3));
        let renderer = PreviewRenderer::new(80);
        assert_eq!(step(&camera, &live, &renderer), Step::Idle);
        assert!(live.latest_preview().is_none());
    }

    #[test]
    fn test_step_publishes_frame_and_preview() {
        let camera = test_camera();
        camera.start().unwrap();
        let live = LiveFrameState::new(Duration::from_secs(3));
        let renderer = PreviewRenderer::new(80);

        assert_eq!(step(&camera, &live, &renderer), Step::Published);
        let frame = live.fresh_frame(Duration::from_secs(5)).unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        let preview = live.latest_preview().unwrap();
        assert_eq!(&preview[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_loop_runs_and_shuts_down() {
        let camera = test_camera();
        let live = Arc::new(LiveFrameState::new(Duration::from_secs(3)));
        let capture = CaptureLoop::spawn(
            Arc::clone(&camera),
            Arc::clone(&live),
            Arc::new(PreviewRenderer::new(80)),
            settings(),
        )
        .unwrap();
        assert!(capture.is_running());

        // Idle until a camera is held.
        std::thread::sleep(Duration::from_millis(30));
        assert!(live.latest_preview().is_none());

        camera.start().unwrap();
        assert!(wait_for(|| live.latest_preview().is_some()));

        capture.shutdown();
        assert!(!capture.is_running());
        capture.shutdown();
    }
}
