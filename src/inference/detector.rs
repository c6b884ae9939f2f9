use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::frame::{Detection, Frame};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info};

/// A loaded detector, owned by exactly one worker thread.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Loads one detector per model at worker startup.
pub trait DetectorLoader: Send + Sync {
    fn load(&self, model: &str, config: &ModelConfig) -> Result<Box<dyn Detector>>;
}

/// Header line preceding the raw pixels of each frame
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    /// Capture time in microseconds
    pub timestamp: i64,
    pub len: usize,
}

/// First line a detector prints once its weights are loaded
#[derive(Debug, Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    labels: Vec<String>,
}

/// Line-delimited JSON exchange with a detector over a byte stream.
///
/// Requests are a JSON [`FrameHeader`] line followed by `len` BGR bytes;
/// each reply is one JSON array of detections.
pub struct DetectorChannel<W: Write, R: BufRead> {
    model: String,
    writer: W,
    reader: R,
}

impl<W: Write, R: BufRead> DetectorChannel<W, R> {
    pub fn new(model: &str, writer: W, reader: R) -> Self {
        Self {
            model: model.to_string(),
            writer,
            reader,
        }
    }

    /// Wait for the readiness line. Returns the labels the detector announced.
    pub fn handshake(&mut self) -> Result<Vec<String>> {
        let line = self.read_line().map_err(|e| self.load_error(e))?;
        let handshake: Handshake = serde_json::from_str(&line)
            .map_err(|e| self.load_error(format!("invalid ready line {:?}: {}", line, e)))?;
        if !handshake.ready {
            return Err(self.load_error("detector reported not ready"));
        }
        Ok(handshake.labels)
    }

    pub fn request(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if !frame.validate_size() {
            return Err(self.detection_error(format!(
                "frame buffer is {} bytes, expected {} for {}x{}",
                frame.data.len(),
                Frame::expected_len(frame.width, frame.height),
                frame.width,
                frame.height
            )));
        }

        let header = FrameHeader {
            width: frame.width,
            height: frame.height,
            timestamp: frame.timestamp.as_micros(),
            len: frame.data.len(),
        };

        let sent = serde_json::to_writer(&mut self.writer, &header)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.write_all(&frame.data))
            .and_then(|_| self.writer.flush());
        if let Err(e) = sent {
            return Err(self.detection_error(format!("failed to send frame: {}", e)));
        }

        let line = self.read_line().map_err(|e| self.detection_error(e))?;
        serde_json::from_str(&line)
            .map_err(|e| self.detection_error(format!("malformed reply {:?}: {}", line, e)))
    }

    fn read_line(&mut self) -> std::result::Result<String, String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Err("detector closed its output".to_string()),
            Ok(_) => Ok(line.trim_end().to_string()),
            Err(e) => Err(format!("failed to read detector output: {}", e)),
        }
    }

    fn load_error<M: Into<String>>(&self, message: M) -> PipelineError {
        PipelineError::DetectorLoad {
            model: self.model.clone(),
            message: message.into(),
        }
    }

    fn detection_error<M: Into<String>>(&self, message: M) -> PipelineError {
        PipelineError::Detection {
            model: self.model.clone(),
            message: message.into(),
        }
    }
}

/// Detector running as a child process bound to one compute device.
pub struct ProcessDetector {
    child: Child,
    channel: DetectorChannel<ChildStdin, BufReader<ChildStdout>>,
}

impl Detector for ProcessDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.channel.request(frame)
    }
}

impl Drop for ProcessDetector {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns each model's configured detector command.
pub struct ProcessDetectorLoader;

impl ProcessDetectorLoader {
    fn build_command(config: &ModelConfig) -> Option<Command> {
        let (program, args) = config.command.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(weights) = &config.weights {
            cmd.arg("--weights").arg(weights);
        }
        cmd.arg("--threshold")
            .arg(config.threshold.to_string())
            .arg("--img-size")
            .arg(config.input_size.to_string());

        if let Some(device) = &config.device {
            cmd.env("CUDA_VISIBLE_DEVICES", device);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        Some(cmd)
    }
}

impl DetectorLoader for ProcessDetectorLoader {
    fn load(&self, model: &str, config: &ModelConfig) -> Result<Box<dyn Detector>> {
        let load_error = |message: String| PipelineError::DetectorLoad {
            model: model.to_string(),
            message,
        };

        let mut cmd = Self::build_command(config)
            .ok_or_else(|| load_error("no detector command configured".to_string()))?;

        debug!(model, device = ?config.device, "Spawning detector: {:?}", cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| load_error(format!("failed to spawn detector: {}", e)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (stdin, stdout) = match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                return Err(load_error("detector pipes unavailable".to_string()));
            }
        };

        let mut channel = DetectorChannel::new(model, stdin, BufReader::new(stdout));
        let labels = match channel.handshake() {
            Ok(labels) => labels,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        info!(
            model,
            device = config.device.as_deref().unwrap_or("default"),
            "Detector ready with {} labels",
            labels.len()
        );
        Ok(Box::new(ProcessDetector { child, channel }))
    }
}
