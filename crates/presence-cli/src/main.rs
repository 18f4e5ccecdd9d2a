use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use presence_hw::{
    candidates, list_devices, multipart_chunk, BackendKind, CameraController, MJPEG_CONTENT_TYPE,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    fn start_capture(&self) -> zbus::Result<String>;
    fn stop_capture(&self) -> zbus::Result<String>;
    fn register(&self, identity_id: &str, display_name: &str) -> zbus::Result<String>;
    fn reregister(&self, identity_id: &str, display_name: &str) -> zbus::Result<String>;
    fn unregister(&self, identity_id: &str) -> zbus::Result<String>;
    fn mark_attendance(&self) -> zbus::Result<String>;
    fn live_preview(&self) -> zbus::Result<Vec<u8>>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn attendance_log(&self, from: &str, to: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire the camera
    Start,
    /// Release the camera
    Stop,
    /// Enroll the face currently in front of the camera
    Register {
        /// Stable identifier, e.g. an employee number
        identity_id: String,
        /// Name shown on the preview and in the attendance log
        display_name: String,
    },
    /// Replace an enrolled face
    Reregister {
        identity_id: String,
        display_name: String,
    },
    /// Remove an enrolled identity (attendance history is kept)
    Remove {
        identity_id: String,
    },
    /// Match the current face and record check-in or check-out
    Mark,
    /// List enrolled identities
    List,
    /// Show attendance records, newest first
    Log {
        /// First date to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last date to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Show daemon status
    Status,
    /// Save the current preview frame as JPEG
    Preview {
        #[arg(short, long, default_value = "preview.jpg")]
        output: PathBuf,
    },
    /// Write the live preview to stdout as a multipart MJPEG stream
    Stream {
        /// Delay between frames
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        /// Stop after this many frames
        #[arg(long)]
        count: Option<u64>,
        /// Start with a CGI `Content-Type` header so a web server can relay the stream
        #[arg(long)]
        cgi: bool,
    },
    /// Probe cameras directly, bypassing the daemon
    Cameras {
        /// Device indices to probe
        #[arg(long, value_delimiter = ',', default_value = "0,1,2")]
        index: Vec<u32>,
        /// Backends to try for each index
        #[arg(long, value_delimiter = ',', default_value = "v4l2-yuyv,v4l2-mjpeg,v4l2-grey")]
        backend: Vec<BackendKind>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cameras { index, backend } => probe_cameras(&index, &backend),
        command => run(command, cli.session).await,
    }
}

async fn run(command: Commands, session: bool) -> Result<()> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;
    tracing::debug!(session, "connected to presenced");

    match command {
        Commands::Start => report(&proxy.start_capture().await?)?,
        Commands::Stop => report(&proxy.stop_capture().await?)?,
        Commands::Register {
            identity_id,
            display_name,
        } => report(&proxy.register(&identity_id, &display_name).await?)?,
        Commands::Reregister {
            identity_id,
            display_name,
        } => report(&proxy.reregister(&identity_id, &display_name).await?)?,
        Commands::Remove { identity_id } => report(&proxy.unregister(&identity_id).await?)?,
        Commands::Mark => report(&proxy.mark_attendance().await?)?,
        Commands::List => {
            let identities: Vec<Value> = serde_json::from_str(&proxy.list_identities().await?)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!("{:<16} {}", text(&identity["identity_id"]), text(&identity["display_name"]));
            }
        }
        Commands::Log { from, to } => {
            let from = from.map(|d| d.to_string()).unwrap_or_default();
            let to = to.map(|d| d.to_string()).unwrap_or_default();
            let entries: Vec<Value> = serde_json::from_str(&proxy.attendance_log(&from, &to).await?)?;
            println!("{:<12} {:<16} {:<20} {:<20} {:<20}", "DATE", "ID", "NAME", "CHECK-IN", "CHECK-OUT");
            for e in entries {
                println!(
                    "{:<12} {:<16} {:<20} {:<20} {:<20}",
                    text(&e["date"]),
                    text(&e["identity_id"]),
                    text(&e["display_name"]),
                    text(&e["check_in_time"]),
                    text(&e["check_out_time"]),
                );
            }
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Preview { output } => {
            let jpeg = proxy.live_preview().await?;
            let img = image::load_from_memory(&jpeg).context("daemon returned an unreadable preview")?;
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {}x{} preview to {}", img.width(), img.height(), output.display());
        }
        Commands::Stream {
            interval_ms,
            count,
            cgi,
        } => {
            let mut stdout = std::io::stdout().lock();
            if cgi {
                write!(stdout, "Content-Type: {MJPEG_CONTENT_TYPE}\r\n\r\n")?;
            }
            let mut sent = 0u64;
            while count.map_or(true, |n| sent < n) {
                let jpeg = proxy.live_preview().await?;
                stdout.write_all(&multipart_chunk(&jpeg))?;
                stdout.flush()?;
                sent += 1;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }
        Commands::Cameras { index, backend } => probe_cameras(&index, &backend)?,
    }

    Ok(())
}

/// Print an operation outcome; failures become a non-zero exit.
fn report(raw: &str) -> Result<()> {
    let outcome: Value = serde_json::from_str(raw).context("malformed reply from presenced")?;
    let message = text(&outcome["message"]);
    let kind = text(&outcome["kind"]);
    if outcome["ok"].as_bool() != Some(true) {
        bail!("{kind}: {message}");
    }
    match outcome["distance"].as_f64() {
        Some(d) => println!("{message} (distance {d:.3})"),
        None => println!("{message}"),
    }
    Ok(())
}

fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn probe_cameras(indices: &[u32], backends: &[BackendKind]) -> Result<()> {
    let devices = list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{:<14} {:<28} driver={} bus={}", d.path, d.name, d.driver, d.bus);
    }

    println!();
    let controller = CameraController::new(candidates(indices, backends));
    let reports = controller.probe_all();
    for r in &reports {
        let verdict = if r.ok { "ok" } else { "FAIL" };
        println!("{:<20} {:<5} {:>5} ms  {}", r.candidate, verdict, r.elapsed_ms, r.detail);
    }
    if !reports.iter().any(|r| r.ok) {
        bail!("no camera candidate produced a frame");
    }
    Ok(())
}
