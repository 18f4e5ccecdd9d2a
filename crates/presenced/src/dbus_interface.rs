use crate::service::RecognitionService;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// D-Bus interface for the presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Every method runs the synchronous service on tokio's blocking pool.
/// Structured results are JSON strings.
pub struct AttendanceInterface {
    service: Arc<RecognitionService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<RecognitionService>) -> Self {
        Self { service }
    }

    async fn blocking<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&RecognitionService) -> T + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker failed: {e}")))
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn require(name: &str, value: &str) -> zbus::fdo::Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs(format!("{name} must not be empty")));
    }
    Ok(value.to_string())
}

/// Empty string means unbounded.
fn parse_date(name: &str, value: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{name}: {e}")))
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceInterface {
    /// Acquire the camera.
    async fn start_capture(&self) -> zbus::fdo::Result<String> {
        let outcome = self.blocking(|s| s.start_capture()).await?;
        to_json(&outcome)
    }

    /// Release the camera.
    async fn stop_capture(&self) -> zbus::fdo::Result<String> {
        let outcome = self.blocking(|s| s.stop_capture()).await?;
        to_json(&outcome)
    }

    /// Enroll the face currently in front of the camera.
    async fn register(&self, identity_id: &str, display_name: &str) -> zbus::fdo::Result<String> {
        let id = require("identity_id", identity_id)?;
        let name = require("display_name", display_name)?;
        tracing::info!(identity = %id, "register requested");
        let outcome = self.blocking(move |s| s.register(&id, &name)).await?;
        to_json(&outcome)
    }

    /// Replace an enrolled identity's face with the one in front of the camera.
    async fn reregister(&self, identity_id: &str, display_name: &str) -> zbus::fdo::Result<String> {
        let id = require("identity_id", identity_id)?;
        let name = require("display_name", display_name)?;
        tracing::info!(identity = %id, "reregister requested");
        let outcome = self.blocking(move |s| s.reregister(&id, &name)).await?;
        to_json(&outcome)
    }

    /// Remove an enrolled identity.
    async fn unregister(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let id = require("identity_id", identity_id)?;
        tracing::info!(identity = %id, "unregister requested");
        let outcome = self.blocking(move |s| s.unregister(&id)).await?;
        to_json(&outcome)
    }

    /// Match the current face and record attendance.
    async fn mark_attendance(&self) -> zbus::fdo::Result<String> {
        let outcome = self.blocking(|s| s.match_and_record_attendance()).await?;
        to_json(&outcome)
    }

    /// Latest annotated preview as JPEG bytes, or an offline placeholder.
    async fn live_preview(&self) -> zbus::fdo::Result<Vec<u8>> {
        self.blocking(|s| s.get_live_preview()).await
    }

    /// Enrolled identities as a JSON array.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self
            .blocking(|s| s.list_identities())
            .await?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&identities)
    }

    /// Attendance records between two `YYYY-MM-DD` dates; empty means unbounded.
    async fn attendance_log(&self, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let from = parse_date("from", from)?;
        let to = parse_date("to", to)?;
        let entries = self
            .blocking(move |s| s.attendance_log(from, to))
            .await?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&entries)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.blocking(|s| s.status()).await?;
        to_json(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_trims_and_rejects_empty() {
        assert_eq!(require("identity_id", "  e42 ").unwrap(), "e42");
        assert!(matches!(
            require("identity_id", "   "),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_parse_date_bounds() {
        assert_eq!(parse_date("from", "").unwrap(), None);
        assert_eq!(
            parse_date("from", "2026-03-02").unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 2)
        );
        assert!(matches!(
            parse_date("to", "02/03/2026"),
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }
}
