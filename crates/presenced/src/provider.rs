//! Embedding provider backed by an external helper program.
//!
//! Each request runs the helper once: the frame goes to its stdin as a JPEG
//! and one JSON object comes back on stdout, either
//! `{"embedding": [...], "facial_area": {"x", "y", "w", "h"}}` or
//! `{"error": "no_face"}` / `{"error": "<message>"}`.

use image::RgbImage;
use presence_core::{BoundingBox, Embedding, EmbeddingProvider, FaceEmbedding, ProviderError};
use presence_hw::preview::encode_jpeg;
use serde::Deserialize;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

const JPEG_QUALITY: u8 = 92;
const NO_FACE: &str = "no_face";

#[derive(Deserialize)]
struct FacialArea {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HelperReply {
    Face {
        embedding: Vec<f32>,
        facial_area: FacialArea,
        #[serde(default)]
        model: Option<String>,
    },
    Error {
        error: String,
    },
}

pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProvider {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, ProviderError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ProviderError::Failed("empty embed command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn run(&self, jpeg: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProviderError::Failed(format!("cannot run {}: {e}", self.program)))?;

        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProviderError::Failed("helper pipes unavailable".into()));
        };

        std::thread::spawn(move || {
            // The helper may exit without reading everything; a broken pipe is its answer.
            let _ = stdin.write_all(&jpeg);
        });

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut out = Vec::new();
            let _ = tx.send(stdout.read_to_end(&mut out).map(|_| out));
        });

        let output = match rx.recv_timeout(self.timeout) {
            Ok(read) => read.map_err(|e| ProviderError::Failed(format!("reading helper output: {e}")))?,
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(program = %self.program, timeout = ?self.timeout, "embedding helper timed out");
                return Err(ProviderError::Failed(format!(
                    "helper timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let status = child
            .wait()
            .map_err(|e| ProviderError::Failed(format!("waiting for helper: {e}")))?;
        if !status.success() && output.is_empty() {
            return Err(ProviderError::Failed(format!("helper exited with {status}")));
        }
        Ok(output)
    }
}

impl EmbeddingProvider for CommandProvider {
    fn embed(&self, image: &RgbImage) -> Result<FaceEmbedding, ProviderError> {
        let jpeg = encode_jpeg(image, JPEG_QUALITY)
            .map_err(|e| ProviderError::Failed(e.to_string()))?;
        let output = self.run(jpeg)?;
        parse_reply(&output)
    }
}

fn parse_reply(output: &[u8]) -> Result<FaceEmbedding, ProviderError> {
    let reply: HelperReply = serde_json::from_slice(output)
        .map_err(|e| ProviderError::Failed(format!("unreadable helper reply: {e}")))?;

    match reply {
        HelperReply::Error { error } if error == NO_FACE => Err(ProviderError::NoFaceDetected),
        HelperReply::Error { error } => Err(ProviderError::Failed(error)),
        HelperReply::Face {
            embedding,
            facial_area,
            model,
        } => {
            if embedding.is_empty() {
                return Err(ProviderError::Failed("helper returned an empty embedding".into()));
            }
            let mut embedding = Embedding::new(embedding);
            embedding.model_version = model;
            Ok(FaceEmbedding {
                embedding,
                detection: BoundingBox {
                    x: facial_area.x,
                    y: facial_area.y,
                    width: facial_area.w,
                    height: facial_area.h,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str, timeout: Duration) -> CommandProvider {
        let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandProvider::new(&command, timeout).unwrap()
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(16, 12, image::Rgb([90, 120, 150]))
    }

    #[test]
    fn test_parse_face_reply() {
        let face = parse_reply(
            br#"{"embedding":[0.5,-0.25,1.0],"facial_area":{"x":10,"y":20,"w":30,"h":40},"model":"arcface"}"#,
        )
        .unwrap();
        assert_eq!(face.embedding.values, vec![0.5, -0.25, 1.0]);
        assert_eq!(face.embedding.model_version.as_deref(), Some("arcface"));
        assert_eq!(
            face.detection,
            BoundingBox { x: 10.0, y: 20.0, width: 30.0, height: 40.0 }
        );
    }

    #[test]
    fn test_parse_error_replies() {
        assert!(matches!(
            parse_reply(br#"{"error":"no_face"}"#),
            Err(ProviderError::NoFaceDetected)
        ));
        assert!(matches!(
            parse_reply(br#"{"error":"model not loaded"}"#),
            Err(ProviderError::Failed(m)) if m == "model not loaded"
        ));
        assert!(matches!(parse_reply(b"not json"), Err(ProviderError::Failed(_))));
        assert!(matches!(
            parse_reply(br#"{"embedding":[],"facial_area":{"x":0,"y":0,"w":1,"h":1}}"#),
            Err(ProviderError::Failed(_))
        ));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandProvider::new(&[], Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_helper_round_trip() {
        let provider = sh(
            r#"cat >/dev/null; echo '{"embedding":[1,0,0],"facial_area":{"x":1,"y":2,"w":3,"h":4}}'"#,
            Duration::from_secs(10),
        );
        let face = provider.embed(&image()).unwrap();
        assert_eq!(face.embedding.values, vec![1.0, 0.0, 0.0]);
        assert_eq!(face.detection.width, 3.0);
    }

    #[test]
    fn test_helper_receives_jpeg() {
        // Echo back the first two stdin bytes as the embedding.
        let provider = sh(
            r#"b=$(head -c 2 | od -An -tu1 | tr -s ' ' ','); cat >/dev/null; echo "{\"embedding\":[0${b%,}],\"facial_area\":{\"x\":0,\"y\":0,\"w\":1,\"h\":1}}""#,
            Duration::from_secs(10),
        );
        let face = provider.embed(&image()).unwrap();
        assert_eq!(face.embedding.values, vec![0.0, 255.0, 216.0]);
    }

    #[test]
    fn test_helper_no_face() {
        let provider = sh(r#"cat >/dev/null; echo '{"error":"no_face"}'"#, Duration::from_secs(10));
        assert!(matches!(provider.embed(&image()), Err(ProviderError::NoFaceDetected)));
    }

    #[test]
    fn test_helper_crash_is_failure() {
        let provider = sh("exit 3", Duration::from_secs(10));
        assert!(matches!(provider.embed(&image()), Err(ProviderError::Failed(_))));
    }

    #[test]
    fn test_missing_program_is_failure() {
        let provider = CommandProvider::new(
            &["/nonexistent/presence-embed".to_string()],
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(provider.embed(&image()), Err(ProviderError::Failed(_))));
    }

    #[test]
    fn test_helper_killed_after_timeout() {
        let provider = sh("exec sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        assert!(matches!(provider.embed(&image()), Err(ProviderError::Failed(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
