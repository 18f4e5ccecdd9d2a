use anyhow::{Context, Result};
use presence_hw::{candidates, CameraController, PreviewRenderer};
use presence_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod live;
mod provider;
mod service;

use config::{BusKind, Config};
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use provider::CommandProvider;
use service::{RecognitionService, ServiceParts, ServiceSettings, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("loading configuration")?;

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );
    let provider = Arc::new(
        CommandProvider::new(&config.embed_command, config.embed_timeout())
            .context("configuring embedding helper")?,
    );

    let renderer = match &config.font_path {
        Some(path) => match PreviewRenderer::new(config.jpeg_quality).with_font(path) {
            Ok(renderer) => renderer,
            Err(e) => {
                tracing::warn!(error = %e, "preview font unavailable; status text disabled");
                PreviewRenderer::new(config.jpeg_quality)
            }
        },
        None => PreviewRenderer::new(config.jpeg_quality),
    };
    tracing::debug!(status_text = renderer.has_font(), "preview renderer ready");

    let camera = CameraController::new(candidates(&config.camera_indices, &config.camera_backends));
    tracing::info!(
        candidates = ?camera.candidates().iter().map(|c| c.label()).collect::<Vec<_>>(),
        registration_threshold = config.registration_threshold,
        matching_threshold = config.matching_threshold,
        "camera candidates configured"
    );

    let service = Arc::new(
        RecognitionService::start(
            ServiceParts {
                camera,
                renderer,
                provider,
                identities: store.clone(),
                ledger: store,
                clock: Arc::new(SystemClock),
            },
            ServiceSettings::from_config(&config),
        )
        .context("starting recognition service")?,
    );

    if config.autostart_camera {
        let svc = Arc::clone(&service);
        let outcome = tokio::task::spawn_blocking(move || svc.start_capture()).await?;
        if !outcome.ok {
            tracing::warn!(message = %outcome.message, "camera autostart failed; waiting for StartCapture");
        }
    }

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceInterface::new(Arc::clone(&service)))?
        .build()
        .await
        .context("claiming D-Bus name")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    tokio::task::spawn_blocking(move || service.shutdown()).await?;

    Ok(())
}
