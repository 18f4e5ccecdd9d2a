use presence_hw::BackendKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// System-wide config file, read when `PRESENCE_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/presence/presenced.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "system" => Ok(BusKind::System),
            "session" => Ok(BusKind::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Daemon configuration: TOML file, then `PRESENCE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device indices to try, in order (`/dev/video{N}`).
    pub camera_indices: Vec<u32>,
    /// Backends to try for each index, in order.
    pub camera_backends: Vec<BackendKind>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance below which a new enrollment collides with an existing identity.
    pub registration_threshold: f32,
    /// Cosine distance below which a probe matches an identity.
    pub matching_threshold: f32,
    /// How long a status message stays on the preview.
    pub status_timeout_ms: u64,
    /// Capture loop sleep while no camera is held.
    pub idle_backoff_ms: u64,
    /// Capture loop sleep after a failed read.
    pub read_backoff_ms: u64,
    /// Frames older than this are not used for recognition.
    pub max_frame_age_ms: u64,
    pub jpeg_quality: u8,
    /// TTF/OTF font for preview status text. Without one only the swatch is drawn.
    pub font_path: Option<PathBuf>,
    /// Embedding helper program followed by its arguments.
    pub embed_command: Vec<String>,
    pub embed_timeout_secs: u64,
    /// Acquire the camera as soon as the daemon is up.
    pub autostart_camera: bool,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_indices: vec![0, 1, 2],
            camera_backends: vec![
                BackendKind::V4l2Yuyv,
                BackendKind::V4l2Mjpeg,
                BackendKind::V4l2Grey,
            ],
            db_path: default_data_dir().join("attendance.db"),
            registration_threshold: 0.40,
            matching_threshold: 0.48,
            status_timeout_ms: 3000,
            idle_backoff_ms: 100,
            read_backoff_ms: 50,
            max_frame_age_ms: 2000,
            jpeg_quality: 80,
            font_path: None,
            embed_command: vec!["/usr/lib/presence/presence-embed".to_string()],
            embed_timeout_secs: 10,
            autostart_camera: false,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load from the config file (if any), apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os("PRESENCE_CONFIG") {
            Some(p) => Some(PathBuf::from(p)),
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };

        let mut config = match &path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::debug!(
            file = ?path,
            db = %config.db_path.display(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply `PRESENCE_*` overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        env_list(&var, "PRESENCE_CAMERA_INDICES", &mut self.camera_indices);
        env_list(&var, "PRESENCE_CAMERA_BACKENDS", &mut self.camera_backends);
        if let Some(path) = var("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        env_parse(&var, "PRESENCE_REGISTRATION_THRESHOLD", &mut self.registration_threshold);
        env_parse(&var, "PRESENCE_MATCHING_THRESHOLD", &mut self.matching_threshold);
        env_parse(&var, "PRESENCE_STATUS_TIMEOUT_MS", &mut self.status_timeout_ms);
        env_parse(&var, "PRESENCE_IDLE_BACKOFF_MS", &mut self.idle_backoff_ms);
        env_parse(&var, "PRESENCE_READ_BACKOFF_MS", &mut self.read_backoff_ms);
        env_parse(&var, "PRESENCE_MAX_FRAME_AGE_MS", &mut self.max_frame_age_ms);
        env_parse(&var, "PRESENCE_JPEG_QUALITY", &mut self.jpeg_quality);
        if let Some(path) = var("PRESENCE_FONT_PATH") {
            self.font_path = Some(PathBuf::from(path)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(cmd) = var("PRESENCE_EMBED_COMMAND") {
            self.embed_command = cmd.split_whitespace().map(str::to_string).collect();
        }
        env_parse(&var, "PRESENCE_EMBED_TIMEOUT_SECS", &mut self.embed_timeout_secs);
        if let Some(v) = var("PRESENCE_AUTOSTART_CAMERA") {
            self.autostart_camera = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        env_parse(&var, "PRESENCE_BUS", &mut self.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        for (name, value) in [
            ("registration_threshold", self.registration_threshold),
            ("matching_threshold", self.matching_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 2.0 {
                return invalid(format!("{name} must be in (0, 2], got {value}"));
            }
        }
        if self.registration_threshold >= self.matching_threshold {
            return invalid(format!(
                "registration_threshold ({}) must be below matching_threshold ({})",
                self.registration_threshold, self.matching_threshold
            ));
        }
        if self.camera_indices.is_empty() {
            return invalid("camera_indices is empty".into());
        }
        if self.camera_backends.is_empty() {
            return invalid("camera_backends is empty".into());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!("jpeg_quality must be 1-100, got {}", self.jpeg_quality));
        }
        if self.embed_command.is_empty() {
            return invalid("embed_command is empty".into());
        }
        if self.embed_timeout_secs == 0 || self.status_timeout_ms == 0 || self.max_frame_age_ms == 0 {
            return invalid("timeouts must be non-zero".into());
        }
        Ok(())
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    pub fn max_frame_age(&self) -> Duration {
        Duration::from_millis(self.max_frame_age_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence")
}

fn env_parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

/// Comma-separated list override. Replaced only if every element parses.
fn env_list<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Vec<T>) {
    let Some(raw) = var(key) else {
        return;
    };
    let parsed: Result<Vec<T>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect();
    match parsed {
        Ok(values) => *slot = values,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.registration_threshold, 0.40);
        assert_eq!(config.matching_threshold, 0.48);
        assert_eq!(config.status_timeout(), Duration::from_secs(3));
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_indices = [2]
            camera_backends = ["v4l2-mjpeg", "test-pattern"]
            matching_threshold = 0.5
            bus = "session"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_indices, vec![2]);
        assert_eq!(
            config.camera_backends,
            vec![BackendKind::V4l2Mjpeg, BackendKind::TestPattern]
        );
        assert_eq!(config.matching_threshold, 0.5);
        assert_eq!(config.registration_threshold, 0.40);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(Config::from_toml("camera_device = \"/dev/video0\"").is_err());
        assert!(Config::from_toml("camera_backends = [\"gstreamer\"]").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("PRESENCE_CAMERA_INDICES", "4, 0"),
            ("PRESENCE_CAMERA_BACKENDS", "test-pattern"),
            ("PRESENCE_DB_PATH", "/var/lib/presence/a.db"),
            ("PRESENCE_MATCHING_THRESHOLD", "0.55"),
            ("PRESENCE_EMBED_COMMAND", "python3 /opt/embed.py --model arcface"),
            ("PRESENCE_AUTOSTART_CAMERA", "1"),
            ("PRESENCE_BUS", "session"),
        ]));
        assert_eq!(config.camera_indices, vec![4, 0]);
        assert_eq!(config.camera_backends, vec![BackendKind::TestPattern]);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/presence/a.db"));
        assert_eq!(config.matching_threshold, 0.55);
        assert_eq!(
            config.embed_command,
            vec!["python3", "/opt/embed.py", "--model", "arcface"]
        );
        assert!(config.autostart_camera);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_bad_env_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("PRESENCE_MATCHING_THRESHOLD", "lots"),
            ("PRESENCE_CAMERA_BACKENDS", "v4l2-yuyv,bogus"),
        ]));
        assert_eq!(config.matching_threshold, 0.48);
        assert_eq!(config.camera_backends.len(), 3);
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = Config::default();
        config.registration_threshold = 0.48;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.registration_threshold = 0.6;
        assert!(config.validate().is_err());
        config.registration_threshold = 0.3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_lists() {
        let mut config = Config::default();
        config.camera_indices.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embed_command.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/presenced.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
