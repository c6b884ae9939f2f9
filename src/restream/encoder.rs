use crate::error::{PipelineError, Result};
use crate::frame::Frame;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info};

/// Output container selected from the sink URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkProtocol {
    Rtsp,
    Flv,
    MpegTs,
}

impl SinkProtocol {
    /// `None` for schemes the encoder cannot publish to
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        if rest.is_empty() {
            return None;
        }
        match scheme.to_ascii_lowercase().as_str() {
            "rtsp" | "rtsps" => Some(Self::Rtsp),
            "rtmp" | "rtmps" => Some(Self::Flv),
            "srt" | "udp" => Some(Self::MpegTs),
            _ => None,
        }
    }

    /// ffmpeg muxer name
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Rtsp => "rtsp",
            Self::Flv => "flv",
            Self::MpegTs => "mpegts",
        }
    }
}

/// Fixed encoding parameters of one camera's restream
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub protocol: SinkProtocol,
    pub sink: String,
}

impl EncoderSettings {
    pub fn new(sink: &str, width: u32, height: u32, fps: f64) -> Result<Self> {
        let protocol = SinkProtocol::from_url(sink).ok_or_else(|| {
            PipelineError::invalid_config("sink", format!("unsupported sink scheme in `{}`", sink))
        })?;
        Ok(Self {
            width,
            height,
            fps,
            protocol,
            sink: sink.to_string(),
        })
    }

    /// Arguments after the `ffmpeg` program name
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let fps = if self.fps.fract() == 0.0 {
            format!("{}", self.fps as u64)
        } else {
            format!("{:.3}", self.fps)
        };

        let size = format!("{}x{}", self.width, self.height);
        let args: [&str; 22] = [
            "-y",
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-pix_fmt",
            "bgr24",
            "-s",
            &size,
            "-r",
            &fps,
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-preset",
            "ultrafast",
            "-f",
            self.protocol.muxer(),
            &self.sink,
        ];
        args.iter().map(|arg| arg.to_string()).collect()
    }
}

/// Destination of annotated frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
}

/// Opens one sink per restreamed camera at startup.
pub trait SinkFactory: Send + Sync {
    fn open(&self, camera: &str, settings: &EncoderSettings) -> Result<Box<dyn FrameSink>>;
}

/// `ffmpeg` child process reading raw BGR24 frames on stdin.
pub struct FfmpegEncoder {
    camera: String,
    width: u32,
    height: u32,
    child: Child,
    stdin: ChildStdin,
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height || !frame.validate_size() {
            return Err(PipelineError::Encoder {
                camera: self.camera.clone(),
                message: format!(
                    "frame is {}x{} ({} bytes), encoder expects {}x{}",
                    frame.width,
                    frame.height,
                    frame.data.len(),
                    self.width,
                    self.height
                ),
            });
        }

        self.stdin
            .write_all(&frame.data)
            .map_err(|e| PipelineError::Encoder {
                camera: self.camera.clone(),
                message: format!("failed to write to encoder: {}", e),
            })
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct FfmpegSinkFactory;

impl SinkFactory for FfmpegSinkFactory {
    fn open(&self, camera: &str, settings: &EncoderSettings) -> Result<Box<dyn FrameSink>> {
        let args = settings.ffmpeg_args();
        debug!(camera, "Spawning encoder: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PipelineError::startup(
                    format!("restream/{}", camera),
                    format!("failed to spawn encoder: {}", e),
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::startup(format!("restream/{}", camera), "encoder stdin unavailable")
        })?;

        info!(
            camera,
            "Encoder started: {}x{} @ {} fps -> {} ({})",
            settings.width,
            settings.height,
            settings.fps,
            settings.sink,
            settings.protocol.muxer()
        );

        Ok(Box::new(FfmpegEncoder {
            camera: camera.to_string(),
            width: settings.width,
            height: settings.height,
            child,
            stdin,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_scheme() {
        assert_eq!(SinkProtocol::from_url("rtsp://127.0.0.1:8554/gate"), Some(SinkProtocol::Rtsp));
        assert_eq!(SinkProtocol::from_url("RTSPS://media/gate"), Some(SinkProtocol::Rtsp));
        assert_eq!(SinkProtocol::from_url("rtmp://live/app/gate"), Some(SinkProtocol::Flv));
        assert_eq!(SinkProtocol::from_url("srt://10.0.0.2:9000"), Some(SinkProtocol::MpegTs));
        assert_eq!(SinkProtocol::from_url("udp://239.0.0.1:1234"), Some(SinkProtocol::MpegTs));
        assert_eq!(SinkProtocol::from_url("http://example.com/out"), None);
        assert_eq!(SinkProtocol::from_url("rtmp://"), None);
        assert_eq!(SinkProtocol::from_url("/tmp/out.flv"), None);
    }

    #[test]
    fn test_encoder_arguments() {
        let settings = EncoderSettings::new("rtmp://127.0.0.1/live/gate", 1280, 720, 25.0).unwrap();
        assert_eq!(
            settings.ffmpeg_args().join(" "),
            "-y -f rawvideo -vcodec rawvideo -pix_fmt bgr24 -s 1280x720 -r 25 -i - \
             -c:v libx264 -pix_fmt yuv420p -preset ultrafast -f flv rtmp://127.0.0.1/live/gate"
        );
    }

    #[test]
    fn test_fractional_frame_rate() {
        let settings =
            EncoderSettings::new("rtsp://127.0.0.1:8554/gate", 640, 360, 30000.0 / 1001.0).unwrap();
        let args = settings.ffmpeg_args();
        let rate = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[rate + 1], "29.970");
        assert_eq!(args[args.len() - 2], "rtsp");
    }

    #[test]
    fn test_unsupported_sink_rejected() {
        assert!(EncoderSettings::new("file:///tmp/out.mp4", 640, 360, 5.0).is_err());
    }
}
