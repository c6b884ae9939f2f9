use crate::config::{CameraConfig, LinkConfig};
use crate::error::{PipelineError, Result};
use crate::frame::{Frame, Timestamp};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use serde::Deserialize;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Decoded geometry and nominal frame rate of a camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
}

/// An open link to a camera that yields decoded frames.
pub trait FrameReader: Send {
    /// Next decoded frame, or `None` if nothing arrived within the read timeout
    /// or the link is broken.
    fn read(&mut self) -> Option<Frame>;

    /// Whether the decoder behind this link has exited; no further frame can arrive
    fn is_closed(&self) -> bool {
        false
    }
}

/// Opens links to one camera; called again after every link failure.
pub trait SourceConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn FrameReader>>;
}

/// Connector plus the geometry the pipeline was sized for.
pub struct SourceHandle {
    pub connector: Arc<dyn SourceConnector>,
    pub geometry: SourceGeometry,
}

/// Creates per-camera connectors at startup.
pub trait SourceFactory: Send + Sync {
    fn open(&self, camera: &str, config: &CameraConfig, link: &LinkConfig) -> Result<SourceHandle>;
}

/// Decodes cameras through an `ffmpeg` child process producing raw BGR24.
pub struct FfmpegSourceFactory;

impl SourceFactory for FfmpegSourceFactory {
    fn open(&self, camera: &str, config: &CameraConfig, link: &LinkConfig) -> Result<SourceHandle> {
        let url = config.source_url(camera)?;
        let is_file = config.is_file_source();

        let probed = match probe_source(&url, is_file) {
            Ok(geometry) => {
                info!(
                    camera,
                    "Probed source geometry {}x{} @ {:?} fps",
                    geometry.width,
                    geometry.height,
                    geometry.fps
                );
                Some(geometry)
            }
            Err(e) => {
                warn!(camera, "Source probe failed, using configured geometry: {}", e);
                None
            }
        };

        let (width, height) = match (config.output_size, probed) {
            (Some(size), _) => size,
            (None, Some(geometry)) => (geometry.width, geometry.height),
            (None, None) => {
                return Err(PipelineError::invalid_config(
                    format!("cameras.{}.output_size", camera),
                    "source could not be probed and no output size is configured",
                ))
            }
        };

        let geometry = SourceGeometry {
            width,
            height,
            fps: probed.and_then(|g| g.fps),
        };

        Ok(SourceHandle {
            connector: Arc::new(FfmpegConnector {
                camera: camera.to_string(),
                url,
                is_file,
                width,
                height,
                read_timeout: Duration::from_millis(link.read_timeout_ms),
            }),
            geometry,
        })
    }
}

pub struct FfmpegConnector {
    camera: String,
    url: String,
    is_file: bool,
    width: u32,
    height: u32,
    read_timeout: Duration,
}

impl FfmpegConnector {
    fn build_command(&self) -> Command {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if self.is_file {
            cmd.arg("-re");
        } else if self.url.starts_with("rtsp") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }

        cmd.arg("-i")
            .arg(&self.url)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", self.width, self.height))
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl SourceConnector for FfmpegConnector {
    fn connect(&self) -> Result<Box<dyn FrameReader>> {
        let mut child = self.build_command().spawn().map_err(|e| PipelineError::Source {
            camera: self.camera.clone(),
            message: format!("failed to spawn decoder: {}", e),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| PipelineError::Source {
            camera: self.camera.clone(),
            message: "decoder stdout unavailable".to_string(),
        })?;

        let (tx, rx) = bounded(2);
        let (width, height) = (self.width, self.height);
        let camera = self.camera.clone();
        thread::Builder::new()
            .name(format!("decode-{}", self.camera))
            .spawn(move || decode_loop(stdout, width, height, tx, &camera))
            .map_err(|e| PipelineError::Source {
                camera: self.camera.clone(),
                message: format!("failed to spawn decode thread: {}", e),
            })?;

        debug!(camera = %self.camera, "Decoder process started");
        Ok(Box::new(FfmpegFrameReader {
            child,
            frames: rx,
            read_timeout: self.read_timeout,
            closed: false,
        }))
    }
}

fn decode_loop(
    mut stdout: ChildStdout,
    width: u32,
    height: u32,
    tx: crossbeam::channel::Sender<Frame>,
    camera: &str,
) {
    let frame_bytes = Frame::expected_len(width, height);
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        if let Err(e) = stdout.read_exact(&mut buffer) {
            debug!(camera, "Decoder output ended: {}", e);
            break;
        }
        if tx
            .send(Frame::new(Timestamp::now(), buffer, width, height))
            .is_err()
        {
            break;
        }
    }
}

struct FfmpegFrameReader {
    child: Child,
    frames: Receiver<Frame>,
    read_timeout: Duration,
    /// Decode thread finished and every buffered frame was read
    closed: bool,
}

impl FrameReader for FfmpegFrameReader {
    fn read(&mut self) -> Option<Frame> {
        match self.frames.recv_timeout(self.read_timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                // Decoder is gone; back off a little so failures are not counted in a spin
                thread::sleep(self.read_timeout.min(Duration::from_millis(10)));
                None
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for FfmpegFrameReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Ask `ffprobe` for the first video stream's geometry
pub fn probe_source(url: &str, is_file: bool) -> Result<SourceGeometry> {
    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v").arg("error");
    if !is_file && url.starts_with("rtsp") {
        cmd.arg("-rtsp_transport").arg("tcp");
    }
    let output = cmd
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,r_frame_rate")
        .arg("-of")
        .arg("json")
        .arg(url)
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Err(PipelineError::Source {
            camera: url.to_string(),
            message: format!("ffprobe exited with {}", output.status),
        });
    }

    parse_probe(&output.stdout)
}

fn parse_probe(json: &[u8]) -> Result<SourceGeometry> {
    let probe: ProbeOutput = serde_json::from_slice(json)?;
    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.width.is_some() && s.height.is_some())
        .ok_or_else(|| PipelineError::system("probe reported no video stream"))?;

    Ok(SourceGeometry {
        width: stream.width.unwrap_or_default(),
        height: stream.height.unwrap_or_default(),
        fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
    })
}

/// Parse ffprobe's `num/den` frame rate
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if num <= 0.0 || den <= 0.0 {
        return None;
    }
    Some(num / den)
}
