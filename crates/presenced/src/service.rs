//! Recognition service: the caller-facing façade over camera, capture loop,
//! embedding provider, cache, identity store and attendance ledger.

use crate::capture::{CaptureLoop, CaptureSettings};
use crate::config::Config;
use crate::live::{
    LiveFrameState, StatusSnapshot, COLOR_ERROR, COLOR_NOTICE, COLOR_SUCCESS, COLOR_WARNING,
};
use chrono::{Local, NaiveDate, NaiveDateTime, SubsecRound};
use presence_core::store::{METHOD_BIOMETRIC, TIMESTAMP_FORMAT};
use presence_core::{
    AttendanceLedger, AttendanceRecord, BoundingBox, CacheEntry, CheckinInsert, CosineMatcher,
    Embedding, EmbeddingCache, EmbeddingProvider, FaceEmbedding, IdentityRecord, IdentityStore,
    Matcher, ProviderError, StoreError,
};
use presence_hw::frame::FrameError;
use presence_hw::{CameraController, CameraError, Frame, PreviewRenderer, StartOutcome};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;

const PLACEHOLDER_TEXT: &str = "Camera offline";

/// Source of "now" for attendance timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time, truncated to whole seconds.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local().trunc_subsecs(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Registered,
    Reregistered,
    Unregistered,
    CheckedIn,
    CheckedOut,
    /// Both ends of today's interval are already recorded.
    ShiftComplete,
    CaptureStarted,
    CaptureAlreadyRunning,
    CaptureStarting,
    CaptureStopped,
    HardwareUnavailable,
    NoFaceDetected,
    AlreadyRegistered,
    IdentityConflict,
    NoIdentitiesEnrolled,
    Unknown,
    NotRegistered,
    StoreUnavailable,
    ProviderUnavailable,
}

impl OutcomeKind {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            OutcomeKind::HardwareUnavailable
                | OutcomeKind::NoFaceDetected
                | OutcomeKind::AlreadyRegistered
                | OutcomeKind::IdentityConflict
                | OutcomeKind::NoIdentitiesEnrolled
                | OutcomeKind::Unknown
                | OutcomeKind::NotRegistered
                | OutcomeKind::StoreUnavailable
                | OutcomeKind::ProviderUnavailable
        )
    }

    fn color(self) -> [u8; 3] {
        match self {
            OutcomeKind::Registered
            | OutcomeKind::Reregistered
            | OutcomeKind::CheckedIn
            | OutcomeKind::CheckedOut => COLOR_SUCCESS,
            OutcomeKind::HardwareUnavailable
            | OutcomeKind::StoreUnavailable
            | OutcomeKind::ProviderUnavailable => COLOR_ERROR,
            kind if kind.is_error() => COLOR_WARNING,
            _ => COLOR_NOTICE,
        }
    }
}

/// Structured result of every caller-facing operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<BoundingBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            ok: !kind.is_error(),
            message: message.into(),
            identity_id: None,
            display_name: None,
            distance: None,
            detection: None,
            at: None,
        }
    }

    fn with_identity(mut self, identity_id: &str, display_name: &str) -> Self {
        self.identity_id = Some(identity_id.to_string());
        self.display_name = Some(display_name.to_string());
        self
    }

    fn with_distance(mut self, distance: Option<f32>) -> Self {
        self.distance = distance;
        self
    }

    fn with_detection(mut self, detection: BoundingBox) -> Self {
        self.detection = Some(detection);
        self
    }

    fn with_time(mut self, at: NaiveDateTime) -> Self {
        self.at = Some(at.format(TIMESTAMP_FORMAT).to_string());
        self
    }
}

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("camera not ready")]
    CameraNotReady,
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no face detected")]
    NoFace,
    #[error("embedding provider unavailable: {0}")]
    Provider(String),
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<ProviderError> for RecognitionError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NoFaceDetected => RecognitionError::NoFace,
            ProviderError::Failed(msg) => RecognitionError::Provider(msg),
        }
    }
}

impl RecognitionError {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            RecognitionError::CameraNotReady
            | RecognitionError::Camera(_)
            | RecognitionError::Frame(_) => OutcomeKind::HardwareUnavailable,
            RecognitionError::NoFace => OutcomeKind::NoFaceDetected,
            RecognitionError::Provider(_) => OutcomeKind::ProviderUnavailable,
            RecognitionError::Store(_) => OutcomeKind::StoreUnavailable,
        }
    }

    fn into_outcome(self) -> Outcome {
        Outcome::new(self.kind(), self.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub registration_threshold: f32,
    pub matching_threshold: f32,
    pub max_frame_age: Duration,
    pub status_timeout: Duration,
    pub capture: CaptureSettings,
    pub placeholder_size: (u32, u32),
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            registration_threshold: config.registration_threshold,
            matching_threshold: config.matching_threshold,
            max_frame_age: config.max_frame_age(),
            status_timeout: config.status_timeout(),
            capture: CaptureSettings {
                idle_backoff: config.idle_backoff(),
                read_backoff: config.read_backoff(),
            },
            placeholder_size: (640, 480),
        }
    }
}

/// Collaborators the service is assembled from.
pub struct ServiceParts {
    pub camera: CameraController,
    pub renderer: PreviewRenderer,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub identities: Arc<dyn IdentityStore>,
    pub ledger: Arc<dyn AttendanceLedger>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub display_name: String,
}

/// Attendance record joined with the identity's current display name.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub camera_started: bool,
    pub camera_device: Option<String>,
    pub capture_running: bool,
    pub identities: usize,
    pub status_message: String,
    pub matched_name: Option<String>,
    pub last_frame_age_ms: Option<u64>,
    pub registration_threshold: f32,
    pub matching_threshold: f32,
}

pub struct RecognitionService {
    camera: Arc<CameraController>,
    live: Arc<LiveFrameState>,
    renderer: Arc<PreviewRenderer>,
    capture: CaptureLoop,
    cache: EmbeddingCache,
    matcher: CosineMatcher,
    provider: Arc<dyn EmbeddingProvider>,
    identities: Arc<dyn IdentityStore>,
    ledger: Arc<dyn AttendanceLedger>,
    clock: Arc<dyn Clock>,
    /// Serializes identity writes so check-then-insert sees a stable gallery.
    identity_lock: Mutex<()>,
    /// Serializes attendance read-then-write.
    ledger_lock: Mutex<()>,
    placeholder: OnceLock<Vec<u8>>,
    settings: ServiceSettings,
}

impl RecognitionService {
    /// Assemble the service and spawn its capture loop. The camera is not
    /// acquired until [`RecognitionService::start_capture`].
    pub fn start(parts: ServiceParts, settings: ServiceSettings) -> std::io::Result<Self> {
        let camera = Arc::new(parts.camera);
        let live = Arc::new(LiveFrameState::new(settings.status_timeout));
        let renderer = Arc::new(parts.renderer);
        let capture = CaptureLoop::spawn(
            Arc::clone(&camera),
            Arc::clone(&live),
            Arc::clone(&renderer),
            settings.capture,
        )?;

        let cache = EmbeddingCache::new();
        match cache.reload(parts.identities.as_ref()) {
            Ok(count) => tracing::info!(identities = count, "embedding cache loaded"),
            Err(e) => tracing::warn!(error = %e, "embedding cache load failed; retrying on demand"),
        }

        Ok(Self {
            camera,
            live,
            renderer,
            capture,
            cache,
            matcher: CosineMatcher,
            provider: parts.provider,
            identities: parts.identities,
            ledger: parts.ledger,
            clock: parts.clock,
            identity_lock: Mutex::new(()),
            ledger_lock: Mutex::new(()),
            placeholder: OnceLock::new(),
            settings,
        })
    }

    pub fn start_capture(&self) -> Outcome {
        let outcome = match self.camera.start() {
            Ok(StartOutcome::Started { device }) => {
                Outcome::new(OutcomeKind::CaptureStarted, format!("camera started: {device}"))
            }
            Ok(StartOutcome::AlreadyRunning { device }) => Outcome::new(
                OutcomeKind::CaptureAlreadyRunning,
                format!("camera already running: {device}"),
            ),
            Ok(StartOutcome::InProgress) => {
                Outcome::new(OutcomeKind::CaptureStarting, "camera start already in progress")
            }
            Ok(StartOutcome::Cancelled) => {
                Outcome::new(OutcomeKind::CaptureStopped, "camera start cancelled by stop")
            }
            Err(e) => RecognitionError::from(e).into_outcome(),
        };
        tracing::info!(kind = ?outcome.kind, message = %outcome.message, "start_capture");
        outcome
    }

    pub fn stop_capture(&self) -> Outcome {
        let released = self.camera.stop();
        self.live.clear_frames();
        let message = if released {
            "camera stopped"
        } else {
            "camera was not running"
        };
        tracing::info!(released, "stop_capture");
        Outcome::new(OutcomeKind::CaptureStopped, message)
    }

    /// Enroll a new identity from the current frame.
    pub fn register(&self, identity_id: &str, display_name: &str) -> Outcome {
        let outcome = self
            .try_register(identity_id, display_name)
            .unwrap_or_else(RecognitionError::into_outcome);
        tracing::info!(identity = identity_id, kind = ?outcome.kind, "register");
        self.show(&outcome);
        outcome
    }

    /// Replace the stored embedding of an existing identity from the current frame.
    pub fn reregister(&self, identity_id: &str, display_name: &str) -> Outcome {
        let outcome = self
            .try_reregister(identity_id, display_name)
            .unwrap_or_else(RecognitionError::into_outcome);
        tracing::info!(identity = identity_id, kind = ?outcome.kind, "reregister");
        self.show(&outcome);
        outcome
    }

    /// Remove an identity. Its attendance history is kept.
    pub fn unregister(&self, identity_id: &str) -> Outcome {
        let outcome = self
            .try_unregister(identity_id)
            .unwrap_or_else(RecognitionError::into_outcome);
        tracing::info!(identity = identity_id, kind = ?outcome.kind, "unregister");
        outcome
    }

    /// Match the current face and advance today's attendance record.
    pub fn match_and_record_attendance(&self) -> Outcome {
        let outcome = self
            .try_match()
            .unwrap_or_else(RecognitionError::into_outcome);
        tracing::info!(
            identity = outcome.identity_id.as_deref().unwrap_or("-"),
            kind = ?outcome.kind,
            distance = ?outcome.distance,
            "match_and_record_attendance"
        );
        self.show(&outcome);
        outcome
    }

    /// Latest annotated preview, or the offline placeholder.
    pub fn get_live_preview(&self) -> Vec<u8> {
        if self.camera.is_started() {
            if let Some(preview) = self.live.latest_preview() {
                return preview;
            }
        }
        self.placeholder().to_vec()
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, RecognitionError> {
        let gallery = self.cache.snapshot_or_reload(self.identities.as_ref())?;
        Ok(gallery
            .iter()
            .map(|e| IdentitySummary {
                identity_id: e.identity_id.clone(),
                display_name: e.display_name.clone(),
            })
            .collect())
    }

    pub fn attendance_log(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceEntry>, RecognitionError> {
        let records = self.ledger.list(from, to)?;
        let gallery = self.cache.snapshot_or_reload(self.identities.as_ref())?;
        let names: HashMap<&str, &str> = gallery
            .iter()
            .map(|e| (e.identity_id.as_str(), e.display_name.as_str()))
            .collect();
        Ok(records
            .into_iter()
            .map(|record| {
                let display_name = names.get(record.identity_id.as_str()).map(|n| n.to_string());
                AttendanceEntry {
                    record,
                    display_name,
                }
            })
            .collect())
    }

    pub fn status(&self) -> ServiceStatus {
        let overlay = self.live.status();
        ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            camera_started: self.camera.is_started(),
            camera_device: self.camera.active_device(),
            capture_running: self.capture.is_running(),
            identities: self.cache.len(),
            status_message: overlay.message,
            matched_name: overlay.matched_name,
            last_frame_age_ms: self.live.last_update_age().map(|d| d.as_millis() as u64),
            registration_threshold: self.settings.registration_threshold,
            matching_threshold: self.settings.matching_threshold,
        }
    }

    /// Stop the capture loop and release the camera. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.capture.shutdown();
        self.camera.stop();
        self.live.clear_frames();
    }

    fn try_register(
        &self,
        identity_id: &str,
        display_name: &str,
    ) -> Result<Outcome, RecognitionError> {
        let face = self.extract()?;

        let _writer = self.identity_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let gallery = self.cache.snapshot_or_reload(self.identities.as_ref())?;

        if gallery.iter().any(|e| e.identity_id == identity_id) {
            return Ok(already_registered(identity_id, display_name).with_detection(face.detection));
        }
        if let Some(conflict) = self.conflict(&face.embedding, &gallery) {
            return Ok(conflict.with_detection(face.detection));
        }

        let record = IdentityRecord {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            embedding: face.embedding,
            created_at: self.clock.now(),
        };
        match self.identities.insert(&record) {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                return Ok(already_registered(identity_id, display_name).with_detection(face.detection));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.cache.reload(self.identities.as_ref()) {
            tracing::error!(identity = identity_id, error = %e, "cache reload failed after insert; rolling back");
            if let Err(undo) = self.identities.delete(identity_id) {
                tracing::error!(identity = identity_id, error = %undo, "rollback of inserted identity failed");
            }
            return Err(e.into());
        }

        Ok(
            Outcome::new(OutcomeKind::Registered, format!("Registered {display_name}"))
                .with_identity(identity_id, display_name)
                .with_detection(face.detection)
                .with_time(record.created_at),
        )
    }

    fn try_reregister(
        &self,
        identity_id: &str,
        display_name: &str,
    ) -> Result<Outcome, RecognitionError> {
        let known = self.cache.snapshot_or_reload(self.identities.as_ref())?;
        if !known.iter().any(|e| e.identity_id == identity_id) {
            return Ok(not_registered(identity_id));
        }

        let face = self.extract()?;

        let _writer = self.identity_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let gallery = self.cache.snapshot_or_reload(self.identities.as_ref())?;
        let others: Vec<CacheEntry> = gallery
            .iter()
            .filter(|e| e.identity_id != identity_id)
            .cloned()
            .collect();
        if let Some(conflict) = self.conflict(&face.embedding, &others) {
            return Ok(conflict.with_detection(face.detection));
        }

        let record = IdentityRecord {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            embedding: face.embedding,
            created_at: self.clock.now(),
        };
        let previous = match self.identities.replace(&record) {
            Ok(previous) => previous,
            Err(StoreError::NotFound(_)) => return Ok(not_registered(identity_id)),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.cache.reload(self.identities.as_ref()) {
            tracing::error!(identity = identity_id, error = %e, "cache reload failed after replace; restoring");
            if let Err(undo) = self.identities.restore(&previous) {
                tracing::error!(identity = identity_id, error = %undo, "restore of previous identity failed");
            }
            return Err(e.into());
        }

        Ok(
            Outcome::new(OutcomeKind::Reregistered, format!("Re-registered {display_name}"))
                .with_identity(identity_id, display_name)
                .with_detection(face.detection)
                .with_time(record.created_at),
        )
    }

    fn try_unregister(&self, identity_id: &str) -> Result<Outcome, RecognitionError> {
        let _writer = self.identity_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = self.identities.delete(identity_id)? else {
            return Ok(not_registered(identity_id));
        };

        if let Err(e) = self.cache.reload(self.identities.as_ref()) {
            tracing::error!(identity = identity_id, error = %e, "cache reload failed after delete; restoring");
            if let Err(undo) = self.identities.restore(&previous) {
                tracing::error!(identity = identity_id, error = %undo, "restore of deleted identity failed");
            }
            return Err(e.into());
        }
        let mut outcome = Outcome::new(OutcomeKind::Unregistered, format!("Removed {identity_id}"));
        outcome.identity_id = Some(identity_id.to_string());
        Ok(outcome)
    }

    fn try_match(&self) -> Result<Outcome, RecognitionError> {
        let face = self.extract()?;

        let gallery = self.cache.snapshot_or_reload(self.identities.as_ref())?;
        if gallery.is_empty() {
            return Ok(
                Outcome::new(OutcomeKind::NoIdentitiesEnrolled, "No identities enrolled")
                    .with_detection(face.detection),
            );
        }

        let result = self
            .matcher
            .compare(&face.embedding, &gallery, self.settings.matching_threshold);
        let (identity_id, display_name) = match (result.matched, result.identity_id, result.display_name) {
            (true, Some(id), Some(name)) => (id, name),
            _ => {
                return Ok(Outcome::new(OutcomeKind::Unknown, "Unknown face")
                    .with_distance(result.distance)
                    .with_detection(face.detection));
            }
        };

        let outcome = self.record_attendance(&identity_id, &display_name)?;
        Ok(outcome
            .with_distance(result.distance)
            .with_detection(face.detection))
    }

    /// Advance today's record for `identity_id`: none → check-in, open → check-out,
    /// closed → no write.
    fn record_attendance(
        &self,
        identity_id: &str,
        display_name: &str,
    ) -> Result<Outcome, RecognitionError> {
        let _ledger = self.ledger_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let today = now.date();

        let outcome = match self.ledger.find(identity_id, today)? {
            None => {
                let check_in = match self
                    .ledger
                    .insert_checkin(identity_id, today, now, METHOD_BIOMETRIC)?
                {
                    CheckinInsert::Inserted(record) => record.check_in_time,
                    CheckinInsert::Duplicate => {
                        tracing::debug!(identity = identity_id, "concurrent check-in detected");
                        self.ledger
                            .find(identity_id, today)?
                            .ok_or_else(|| {
                                StoreError::Corrupt(format!(
                                    "check-in for {identity_id} on {today} not found after conflict"
                                ))
                            })?
                            .check_in_time
                    }
                };
                Outcome::new(OutcomeKind::CheckedIn, format!("Checked in: {display_name}"))
                    .with_time(check_in)
            }
            Some(record) if !record.is_complete() => {
                if self.ledger.update_checkout(record.record_id, now)? {
                    Outcome::new(OutcomeKind::CheckedOut, format!("Checked out: {display_name}"))
                        .with_time(now)
                } else {
                    shift_complete(display_name)
                }
            }
            Some(record) => {
                let outcome = shift_complete(display_name);
                match record.check_out_time {
                    Some(at) => outcome.with_time(at),
                    None => outcome,
                }
            }
        };
        Ok(outcome.with_identity(identity_id, display_name))
    }

    /// Clone out the latest frame and run the provider on it. No lock is held
    /// while the provider runs.
    fn extract(&self) -> Result<FaceEmbedding, RecognitionError> {
        let frame = self.fresh_frame()?;
        let image = frame.to_rgb_image()?;
        Ok(self.provider.embed(&image)?)
    }

    fn fresh_frame(&self) -> Result<Frame, RecognitionError> {
        if !self.camera.is_started() {
            return Err(RecognitionError::CameraNotReady);
        }
        self.live
            .fresh_frame(self.settings.max_frame_age)
            .ok_or(RecognitionError::CameraNotReady)
    }

    fn conflict(&self, probe: &Embedding, gallery: &[CacheEntry]) -> Option<Outcome> {
        let nearest = self
            .matcher
            .compare(probe, gallery, self.settings.registration_threshold);
        match (nearest.matched, nearest.identity_id, nearest.display_name) {
            (true, Some(id), Some(name)) => Some(
                Outcome::new(
                    OutcomeKind::IdentityConflict,
                    format!("Face already registered as {name}"),
                )
                .with_identity(&id, &name)
                .with_distance(nearest.distance),
            ),
            _ => None,
        }
    }

    /// Mirror an outcome on the preview overlay.
    fn show(&self, outcome: &Outcome) {
        self.live.set_status(StatusSnapshot {
            message: outcome.message.clone(),
            color: outcome.kind.color(),
            matched_name: if outcome.ok {
                outcome.display_name.clone()
            } else {
                None
            },
            detection: outcome.detection,
        });
    }

    fn placeholder(&self) -> &[u8] {
        self.placeholder.get_or_init(|| {
            let (width, height) = self.settings.placeholder_size;
            match self.renderer.placeholder(width, height, PLACEHOLDER_TEXT) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    tracing::error!(error = %e, "placeholder render failed");
                    Vec::new()
                }
            }
        })
    }
}

impl Drop for RecognitionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn already_registered(identity_id: &str, display_name: &str) -> Outcome {
    Outcome::new(
        OutcomeKind::AlreadyRegistered,
        format!("{identity_id} is already registered"),
    )
    .with_identity(identity_id, display_name)
}

fn not_registered(identity_id: &str) -> Outcome {
    let mut outcome = Outcome::new(
        OutcomeKind::NotRegistered,
        format!("{identity_id} is not registered"),
    );
    outcome.identity_id = Some(identity_id.to_string());
    outcome
}

fn shift_complete(display_name: &str) -> Outcome {
    Outcome::new(
        OutcomeKind::ShiftComplete,
        format!("{display_name} has already checked in and out today"),
    )
}
