//! Camera backends and the controller that owns the open capture device.
//!
//! A backend is a strategy for opening a device at a given index. The
//! controller walks an ordered list of `(index, backend)` candidates and keeps
//! the first one that delivers a non-empty test frame.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Default capture resolution requested from V4L2 devices.
const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
/// Upper bound on a single dequeue so a wedged device cannot stall the capture loop.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("device returned an empty frame")]
    EmptyFrame,
    #[error("camera not started")]
    NotStarted,
    #[error("no usable camera (tried: {})", .0.join("; "))]
    NoDevice(Vec<String>),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel format a V4L2 backend asks the driver for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale (common IR camera output).
    Grey,
}

impl PixelFormat {
    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }
}

/// Backend selector as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    V4l2Yuyv,
    V4l2Mjpeg,
    V4l2Grey,
    TestPattern,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::V4l2Yuyv => "v4l2-yuyv",
            BackendKind::V4l2Mjpeg => "v4l2-mjpeg",
            BackendKind::V4l2Grey => "v4l2-grey",
            BackendKind::TestPattern => "test-pattern",
        }
    }

    /// Instantiate the backend strategy.
    pub fn backend(self) -> Arc<dyn CaptureBackend> {
        match self {
            BackendKind::V4l2Yuyv => Arc::new(V4l2Backend::new(PixelFormat::Yuyv)),
            BackendKind::V4l2Mjpeg => Arc::new(V4l2Backend::new(PixelFormat::Mjpeg)),
            BackendKind::V4l2Grey => Arc::new(V4l2Backend::new(PixelFormat::Grey)),
            BackendKind::TestPattern => Arc::new(TestPatternBackend::default()),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "v4l2-yuyv" => Ok(BackendKind::V4l2Yuyv),
            "v4l2-mjpeg" => Ok(BackendKind::V4l2Mjpeg),
            "v4l2-grey" => Ok(BackendKind::V4l2Grey),
            "test-pattern" => Ok(BackendKind::TestPattern),
            other => Err(format!("unknown camera backend: {other}")),
        }
    }
}

/// Strategy for opening a capture device by index.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// An open capture device. Owned exclusively by [`CameraController`].
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
    fn describe(&self) -> String;
}

/// V4L2 backend requesting one specific pixel format.
pub struct V4l2Backend {
    format: PixelFormat,
    name: &'static str,
}

impl V4l2Backend {
    pub fn new(format: PixelFormat) -> Self {
        let name = match format {
            PixelFormat::Yuyv => "v4l2-yuyv",
            PixelFormat::Mjpeg => "v4l2-mjpeg",
            PixelFormat::Grey => "v4l2-grey",
        };
        Self { format, name }
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        self.name
    }

    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        let device_path = format!("/dev/video{index}");
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = self.format.fourcc();
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        // Each backend stands for one format; a driver that substitutes another
        // one fails here so the next candidate gets its turn.
        if negotiated.fourcc != self.format.fourcc() {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "requested {:?}, driver chose {:?}",
                self.format.fourcc(),
                negotiated.fourcc
            )));
        }

        let mut stream: MmapStream<'static> =
            MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "opened camera"
        );

        Ok(Box::new(V4l2Device {
            stream,
            _device: device,
            path: device_path,
            card: caps.card,
            width: negotiated.width,
            height: negotiated.height,
            format: self.format,
        }))
    }
}

struct V4l2Device {
    // Declared before the device so streaming stops before the fd closes.
    stream: MmapStream<'static>,
    _device: Device,
    path: String,
    card: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl CaptureDevice for V4l2Device {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let sequence = meta.sequence;

        let (data, width, height) = match self.format {
            PixelFormat::Yuyv => (
                frame::yuyv_to_rgb(buf, self.width, self.height)
                    .map_err(|e| CameraError::CaptureFailed(e.to_string()))?,
                self.width,
                self.height,
            ),
            PixelFormat::Grey => (
                frame::grey_to_rgb(buf, self.width, self.height)
                    .map_err(|e| CameraError::CaptureFailed(e.to_string()))?,
                self.width,
                self.height,
            ),
            PixelFormat::Mjpeg => {
                let used = (meta.bytesused as usize).min(buf.len());
                frame::decode_mjpeg(&buf[..used])
                    .map_err(|e| CameraError::CaptureFailed(e.to_string()))?
            }
        };

        Frame::from_rgb(data, width, height, sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("{} ({}, {:?} {}x{})", self.path, self.card, self.format, self.width, self.height)
    }
}

/// Synthetic source for development without camera hardware.
pub struct TestPatternBackend {
    pub width: u32,
    pub height: u32,
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self {
            width: REQUEST_WIDTH,
            height: REQUEST_HEIGHT,
        }
    }
}

impl CaptureBackend for TestPatternBackend {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(TestPatternDevice {
            index,
            width: self.width,
            height: self.height,
            sequence: 0,
        }))
    }
}

struct TestPatternDevice {
    index: u32,
    width: u32,
    height: u32,
    sequence: u32,
}

impl CaptureDevice for TestPatternDevice {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let shift = (self.sequence % 256) as usize;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push(128);
            }
        }
        let frame = Frame::from_rgb(data, self.width, self.height, self.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }

    fn describe(&self) -> String {
        format!("test-pattern#{} ({}x{})", self.index, self.width, self.height)
    }
}

/// One `(device index, backend)` pairing tried during acquisition.
#[derive(Clone)]
pub struct Candidate {
    pub index: u32,
    pub backend: Arc<dyn CaptureBackend>,
}

impl Candidate {
    pub fn new(index: u32, backend: Arc<dyn CaptureBackend>) -> Self {
        Self { index, backend }
    }

    pub fn label(&self) -> String {
        format!("{}#{}", self.backend.name(), self.index)
    }
}

/// Build the candidate list: every configured index, each with every backend in order.
pub fn candidates(indices: &[u32], backends: &[BackendKind]) -> Vec<Candidate> {
    let strategies: Vec<Arc<dyn CaptureBackend>> = backends.iter().map(|b| b.backend()).collect();
    indices
        .iter()
        .flat_map(|&index| {
            strategies
                .iter()
                .map(move |backend| Candidate::new(index, Arc::clone(backend)))
        })
        .collect()
}

/// Result of a [`CameraController::start`] call that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { device: String },
    AlreadyRunning { device: String },
    /// Another caller is probing right now.
    InProgress,
    /// A `stop` arrived while probing; the probed device was released.
    Cancelled,
}

/// Result of probing one candidate for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub candidate: String,
    pub ok: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

struct ActiveDevice {
    device: Box<dyn CaptureDevice>,
    description: String,
}

/// Owns the capture device handle.
///
/// `active` is held for the length of a dequeue, so the started flag and the
/// device description live outside it and are updated in the same critical
/// section that swaps the handle.
pub struct CameraController {
    candidates: Vec<Candidate>,
    active: Mutex<Option<ActiveDevice>>,
    started: AtomicBool,
    description: Mutex<Option<String>>,
    starting: AtomicBool,
    /// Bumped by every `stop`; a probe that sees it change discards its device.
    stop_epoch: AtomicU64,
}

/// Clears the in-flight flag however `start` exits.
struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CameraController {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            active: Mutex::new(None),
            started: AtomicBool::new(false),
            description: Mutex::new(None),
            starting: AtomicBool::new(false),
            stop_epoch: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveDevice>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_description(&self, description: Option<String>) {
        *self.description.lock().unwrap_or_else(PoisonError::into_inner) = description;
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Acquire the first working candidate.
    ///
    /// Probing happens without the handle lock; the lock is only taken to
    /// install the winner. A call made while another probe is running returns
    /// [`StartOutcome::InProgress`] immediately, and a `stop` that lands during
    /// probing turns the result into [`StartOutcome::Cancelled`].
    pub fn start(&self) -> Result<StartOutcome, CameraError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(StartOutcome::InProgress);
        }
        let _guard = StartingGuard(&self.starting);
        let epoch = self.stop_epoch.load(Ordering::Acquire);

        if let Some(device) = self.active_device() {
            return Ok(StartOutcome::AlreadyRunning { device });
        }

        let mut failures = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            match probe(candidate) {
                Ok(device) => {
                    let description = device.describe();
                    let mut active = self.lock();
                    if self.stop_epoch.load(Ordering::Acquire) != epoch {
                        drop(active);
                        tracing::info!(candidate = %candidate.label(), "camera start cancelled by stop");
                        return Ok(StartOutcome::Cancelled);
                    }
                    tracing::info!(
                        candidate = %candidate.label(),
                        device = %description,
                        "camera acquired"
                    );
                    *active = Some(ActiveDevice {
                        device,
                        description: description.clone(),
                    });
                    self.set_description(Some(description.clone()));
                    self.started.store(true, Ordering::Release);
                    return Ok(StartOutcome::Started {
                        device: description,
                    });
                }
                Err(e) => {
                    tracing::debug!(candidate = %candidate.label(), error = %e, "candidate rejected");
                    failures.push(format!("{}: {e}", candidate.label()));
                }
            }
        }

        tracing::warn!(tried = failures.len(), "no camera candidate produced a frame");
        Err(CameraError::NoDevice(failures))
    }

    /// Release the device if held and cancel any start still probing.
    /// Returns whether there was anything to stop. Safe to call repeatedly.
    pub fn stop(&self) -> bool {
        self.stop_epoch.fetch_add(1, Ordering::AcqRel);
        let pending = self.starting.load(Ordering::Acquire);
        let released = {
            let mut active = self.lock();
            self.started.store(false, Ordering::Release);
            self.set_description(None);
            active.take()
        };
        match released {
            Some(active) => {
                tracing::info!(device = %active.description, "camera released");
                true
            }
            None if pending => {
                tracing::info!("pending camera start cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Description of the held device, if any.
    pub fn active_device(&self) -> Option<String> {
        self.description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the next frame from the held device.
    pub fn read_frame(&self) -> Result<Frame, CameraError> {
        match self.lock().as_mut() {
            Some(active) => active.device.read_frame(),
            None => Err(CameraError::NotStarted),
        }
    }

    /// Try every candidate once and report, without keeping any device open.
    pub fn probe_all(&self) -> Vec<ProbeReport> {
        self.candidates
            .iter()
            .map(|candidate| {
                let started = Instant::now();
                let (ok, detail) = match probe(candidate) {
                    Ok(device) => (true, device.describe()),
                    Err(e) => (false, e.to_string()),
                };
                ProbeReport {
                    candidate: candidate.label(),
                    ok,
                    detail,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            })
            .collect()
    }
}

/// Open a candidate and demand one non-empty frame from it.
fn probe(candidate: &Candidate) -> Result<Box<dyn CaptureDevice>, CameraError> {
    let mut device = candidate.backend.open(candidate.index)?;
    let frame = device.read_frame()?;
    if frame.is_empty() {
        return Err(CameraError::EmptyFrame);
    }
    Ok(device)
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for index in 0..16u32 {
        let path = format!("/dev/video{index}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            index,
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// Backend whose behaviour is scripted per index.
    struct ScriptedBackend {
        name: &'static str,
        good_indices: Vec<u32>,
        empty_frames: bool,
        opens: AtomicUsize,
        open_delay: Duration,
        /// Signalled once an open starts, so tests can race a second start.
        opened_tx: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl ScriptedBackend {
        fn new(name: &'static str, good_indices: Vec<u32>) -> Self {
            Self {
                name,
                good_indices,
                empty_frames: false,
                opens: AtomicUsize::new(0),
                open_delay: Duration::ZERO,
                opened_tx: Mutex::new(None),
            }
        }
    }

    struct ScriptedDevice {
        label: String,
        empty: bool,
        fail_reads: bool,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            if self.fail_reads {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            if self.empty {
                return Ok(Frame::from_rgb(Vec::new(), 0, 0, 0).unwrap());
            }
            Ok(Frame::from_rgb(vec![50; 4 * 4 * 3], 4, 4, 1).unwrap())
        }

        fn describe(&self) -> String {
            self.label.clone()
        }
    }

    impl CaptureBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn open(&self, index: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = self.opened_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            std::thread::sleep(self.open_delay);
            if !self.good_indices.contains(&index) {
                return Err(CameraError::DeviceNotFound(format!("{}#{index}", self.name)));
            }
            Ok(Box::new(ScriptedDevice {
                label: format!("{}#{index}", self.name),
                empty: self.empty_frames,
                fail_reads: false,
            }))
        }
    }

    #[test]
    fn test_candidate_order_is_index_major() {
        let list = candidates(&[0, 2], &[BackendKind::V4l2Yuyv, BackendKind::TestPattern]);
        let labels: Vec<String> = list.iter().map(Candidate::label).collect();
        assert_eq!(
            labels,
            vec!["v4l2-yuyv#0", "test-pattern#0", "v4l2-yuyv#2", "test-pattern#2"]
        );
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("v4l2-mjpeg".parse::<BackendKind>().unwrap(), BackendKind::V4l2Mjpeg);
        assert_eq!(" test-pattern ".parse::<BackendKind>().unwrap(), BackendKind::TestPattern);
        assert!("dshow".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::V4l2Grey.to_string(), "v4l2-grey");
    }

    #[test]
    fn test_start_picks_first_working_candidate() {
        let first = Arc::new(ScriptedBackend::new("first", vec![]));
        let second = Arc::new(ScriptedBackend::new("second", vec![1]));
        let controller = CameraController::new(vec![
            Candidate::new(0, first.clone()),
            Candidate::new(0, second.clone()),
            Candidate::new(1, first.clone()),
            Candidate::new(1, second.clone()),
        ]);

        let outcome = controller.start().unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Started {
                device: "second#1".into()
            }
        );
        assert!(controller.is_started());
        assert_eq!(first.opens.load(Ordering::SeqCst), 2);
        assert_eq!(second.opens.load(Ordering::SeqCst), 2);
        assert!(controller.read_frame().is_ok());
    }

    #[test]
    fn test_start_rejects_empty_frames() {
        let mut empty = ScriptedBackend::new("empty", vec![0]);
        empty.empty_frames = true;
        let good = Arc::new(ScriptedBackend::new("good", vec![0]));
        let controller = CameraController::new(vec![
            Candidate::new(0, Arc::new(empty)),
            Candidate::new(0, good),
        ]);

        assert_eq!(
            controller.start().unwrap(),
            StartOutcome::Started {
                device: "good#0".into()
            }
        );
    }

    #[test]
    fn test_exhausted_candidates_leave_controller_stopped() {
        let backend = Arc::new(ScriptedBackend::new("none", vec![]));
        let controller = CameraController::new(vec![
            Candidate::new(0, backend.clone()),
            Candidate::new(1, backend.clone()),
        ]);

        let started = Instant::now();
        match controller.start() {
            Err(CameraError::NoDevice(tried)) => assert_eq!(tried.len(), 2),
            other => panic!("expected NoDevice, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!controller.is_started());
        assert!(matches!(controller.read_frame(), Err(CameraError::NotStarted)));

        // Re-triable: a second attempt probes again.
        assert!(controller.start().is_err());
        assert_eq!(backend.opens.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_start_when_running_is_already_running() {
        let backend = Arc::new(ScriptedBackend::new("cam", vec![0]));
        let controller = CameraController::new(vec![Candidate::new(0, backend.clone())]);
        controller.start().unwrap();
        assert_eq!(
            controller.start().unwrap(),
            StartOutcome::AlreadyRunning {
                device: "cam#0".into()
            }
        );
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_start_reports_in_progress() {
        let (tx, rx) = mpsc::channel();
        let mut slow = ScriptedBackend::new("slow", vec![0]);
        slow.open_delay = Duration::from_millis(300);
        *slow.opened_tx.lock().unwrap() = Some(tx);
        let slow = Arc::new(slow);
        let controller = Arc::new(CameraController::new(vec![Candidate::new(0, slow.clone())]));

        let c = Arc::clone(&controller);
        let first = std::thread::spawn(move || c.start());
        rx.recv().unwrap();

        assert_eq!(controller.start().unwrap(), StartOutcome::InProgress);
        assert!(matches!(
            first.join().unwrap().unwrap(),
            StartOutcome::Started { .. }
        ));
        assert_eq!(slow.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = Arc::new(ScriptedBackend::new("cam", vec![0]));
        let controller = CameraController::new(vec![Candidate::new(0, backend)]);
        assert!(!controller.stop());
        controller.start().unwrap();
        assert!(controller.stop());
        assert!(!controller.stop());
        assert!(!controller.is_started());
        assert!(matches!(controller.read_frame(), Err(CameraError::NotStarted)));

        // And it can be started again.
        assert!(matches!(controller.start().unwrap(), StartOutcome::Started { .. }));
    }

    #[test]
    fn test_stop_during_start_cancels_it() {
        let (tx, rx) = mpsc::channel();
        let mut slow = ScriptedBackend::new("slow", vec![0]);
        slow.open_delay = Duration::from_millis(300);
        *slow.opened_tx.lock().unwrap() = Some(tx);
        let controller = Arc::new(CameraController::new(vec![Candidate::new(0, Arc::new(slow))]));

        let c = Arc::clone(&controller);
        let first = std::thread::spawn(move || c.start());
        rx.recv().unwrap();

        assert!(controller.stop());
        assert_eq!(first.join().unwrap().unwrap(), StartOutcome::Cancelled);
        assert!(!controller.is_started());
        assert_eq!(controller.active_device(), None);
        assert!(matches!(controller.read_frame(), Err(CameraError::NotStarted)));

        assert!(matches!(controller.start().unwrap(), StartOutcome::Started { .. }));
        assert_eq!(controller.active_device().as_deref(), Some("slow#0"));
    }

    #[test]
    fn test_state_queries_do_not_wait_for_dequeue() {
        struct StalledDevice(mpsc::Sender<()>);
        impl CaptureDevice for StalledDevice {
            fn read_frame(&mut self) -> Result<Frame, CameraError> {
                let _ = self.0.send(());
                std::thread::sleep(Duration::from_millis(800));
                Err(CameraError::CaptureFailed("timeout".into()))
            }
            fn describe(&self) -> String {
                "stalled".into()
            }
        }

        let backend = Arc::new(ScriptedBackend::new("cam", vec![0]));
        let controller = Arc::new(CameraController::new(vec![Candidate::new(0, backend)]));
        controller.start().unwrap();
        let (tx, rx) = mpsc::channel();
        controller.lock().as_mut().unwrap().device = Box::new(StalledDevice(tx));

        let c = Arc::clone(&controller);
        let reader = std::thread::spawn(move || c.read_frame());
        rx.recv().unwrap();

        let asked = Instant::now();
        assert!(controller.is_started());
        assert_eq!(controller.active_device().as_deref(), Some("cam#0"));
        assert!(asked.elapsed() < Duration::from_millis(400));
        assert!(reader.join().unwrap().is_err());
    }

    #[test]
    fn test_read_failure_is_reported_not_fatal() {
        struct Flaky;
        impl CaptureBackend for Flaky {
            fn name(&self) -> &str {
                "flaky"
            }
            fn open(&self, _: u32) -> Result<Box<dyn CaptureDevice>, CameraError> {
                Ok(Box::new(ScriptedDevice {
                    label: "flaky".into(),
                    empty: false,
                    fail_reads: false,
                }))
            }
        }
        let controller = CameraController::new(vec![Candidate::new(0, Arc::new(Flaky))]);
        controller.start().unwrap();
        {
            let mut guard = controller.lock();
            guard.as_mut().unwrap().device = Box::new(ScriptedDevice {
                label: "flaky".into(),
                empty: false,
                fail_reads: true,
            });
        }
        assert!(matches!(controller.read_frame(), Err(CameraError::CaptureFailed(_))));
        assert!(controller.is_started());
    }

    #[test]
    fn test_probe_all_reports_every_candidate() {
        let backend = Arc::new(ScriptedBackend::new("cam", vec![1]));
        let controller = CameraController::new(vec![
            Candidate::new(0, backend.clone()),
            Candidate::new(1, backend),
        ]);
        let reports = controller.probe_all();
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].ok);
        assert!(reports[1].ok);
        assert!(!controller.is_started());
    }

    #[test]
    fn test_pattern_backend_produces_frames() {
        let mut device = TestPatternBackend { width: 8, height: 4 }.open(0).unwrap();
        let a = device.read_frame().unwrap();
        let b = device.read_frame().unwrap();
        assert_eq!(a.data.len(), 8 * 4 * 3);
        assert_eq!(b.sequence, a.sequence + 1);
        assert_ne!(a.data, b.data);
    }
}
