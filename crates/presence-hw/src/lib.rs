//! presence-hw: Camera capture and preview rendering.
//!
//! V4L2 devices are reached through pluggable backends; the
//! [`CameraController`] owns whichever device it managed to open. Preview
//! frames are mirrored, annotated and JPEG-compressed here.

pub mod camera;
pub mod frame;
pub mod preview;

pub use camera::{
    candidates, list_devices, BackendKind, CameraController, CameraError, Candidate,
    CaptureBackend, CaptureDevice, DeviceInfo, ProbeReport, StartOutcome,
};
pub use frame::Frame;
pub use preview::{multipart_chunk, Overlay, PreviewRenderer, MJPEG_CONTENT_TYPE};
