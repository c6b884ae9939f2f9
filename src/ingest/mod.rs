//! Camera acquisition: a link maintainer keeps the latest decoded frame fresh
//! while a sampler feeds the capture rendezvous queue at a fixed rate.

pub mod backoff;
pub mod dispatch;
pub mod source;

#[cfg(test)]
mod tests;

pub use backoff::{Backoff, LinkPolicy};
pub use dispatch::{CaptureDispatcher, ModelRoute};
pub use source::{
    FfmpegSourceFactory, FrameReader, SourceConnector, SourceFactory, SourceGeometry,
    SourceHandle,
};

use crate::error::Result;
use crate::fault::{spawn_component, FaultReporter};
use crate::frame::{Frame, Timestamp};
use crate::rendezvous::OrderedRendezvousQueue;
use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Sampler poll interval while the motion gate is closed
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct StoredFrame {
    frame: Frame,
    /// Monotonic arrival time; the frame's own timestamp follows the wall clock
    stored_at: Instant,
}

/// Most recent decoded frame of one camera.
///
/// Written by the link maintainer, read by the sampler.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Option<StoredFrame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Frame) {
        self.store_at(frame, Instant::now());
    }

    fn store_at(&self, frame: Frame, stored_at: Instant) {
        *self.slot.lock() = Some(StoredFrame { frame, stored_at });
    }

    /// Copy of the current frame; pixel data is shared, not copied
    pub fn snapshot(&self) -> Option<Frame> {
        self.slot.lock().as_ref().map(|stored| stored.frame.clone())
    }

    /// Copy of the current frame and the time since it was stored
    pub fn snapshot_with_age(&self) -> Option<(Frame, Duration)> {
        self.slot
            .lock()
            .as_ref()
            .map(|stored| (stored.frame.clone(), stored.stored_at.elapsed()))
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

/// Pauses sampling of one camera without touching its link.
///
/// Open by default.
#[derive(Clone)]
pub struct MotionGate {
    open: Arc<AtomicBool>,
}

impl MotionGate {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn pause(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Default for MotionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Link maintainer counters
#[derive(Debug, Default)]
pub struct LinkStats {
    pub opens: AtomicU64,
    pub open_failures: AtomicU64,
    pub verify_failures: AtomicU64,
    /// Links abandoned after too many consecutive read failures
    pub abandoned: AtomicU64,
    pub frames: AtomicU64,
}

impl LinkStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Outcome of one open-and-verify attempt
enum LinkAttempt {
    Verified(Box<dyn FrameReader>),
    /// Wait this long before the next attempt; zero reconnects at once
    Retry(Duration),
    Stopped,
}

enum Verification {
    Frame(Frame),
    Closed,
    TimedOut,
    Stopped,
}

/// Keeps one camera link open and the latest frame register fresh.
///
/// Open failures back off multiplicatively; an opened link must deliver a
/// frame within the verify window or it is reopened with a longer window.
/// The maintainer never gives up on its own, only shutdown stops it.
pub struct LinkMaintainer {
    camera: String,
    connector: Arc<dyn SourceConnector>,
    policy: LinkPolicy,
    latest: Arc<LatestFrame>,
    stats: Arc<LinkStats>,
    shutdown: ShutdownSignal,
}

impl LinkMaintainer {
    pub fn run(mut self) -> Result<()> {
        info!(camera = %self.camera, "Link maintainer started");

        while !self.shutdown.is_cancelled() {
            match self.attempt() {
                LinkAttempt::Verified(mut reader) => self.stream(reader.as_mut()),
                LinkAttempt::Retry(wait) => {
                    if !wait.is_zero() && self.shutdown.sleep(wait) {
                        break;
                    }
                }
                LinkAttempt::Stopped => break,
            }
        }

        info!(camera = %self.camera, "Link maintainer stopped");
        Ok(())
    }

    /// Open the source and wait for its first frame.
    ///
    /// A refused open, or a decoder that exits before its first frame, grows the
    /// open backoff. A live link that stays silent grows the verify window and
    /// is reopened at once.
    fn attempt(&mut self) -> LinkAttempt {
        let mut reader = match self.connector.connect() {
            Ok(reader) => {
                LinkStats::bump(&self.stats.opens);
                info!(camera = %self.camera, "Source opened, verifying frames");
                reader
            }
            Err(e) => {
                let wait = self.open_failed();
                warn!(
                    camera = %self.camera,
                    "Failed to open source, retrying in {:?}: {}",
                    wait,
                    e
                );
                return LinkAttempt::Retry(wait);
            }
        };

        let window = self.policy.verify_timeout.current();
        match self.verify(reader.as_mut(), window) {
            Verification::Frame(frame) => {
                self.policy.open_backoff.reset();
                self.policy.verify_timeout.reset();
                self.publish(frame);
                info!(camera = %self.camera, "Source verified, streaming");
                LinkAttempt::Verified(reader)
            }
            Verification::Closed => {
                let wait = self.open_failed();
                warn!(
                    camera = %self.camera,
                    "Decoder exited before its first frame, retrying in {:?}",
                    wait
                );
                LinkAttempt::Retry(wait)
            }
            Verification::TimedOut => {
                self.policy.open_backoff.reset();
                LinkStats::bump(&self.stats.verify_failures);
                self.policy.verify_timeout.next_delay();
                warn!(
                    camera = %self.camera,
                    "No frame within {:?} of opening, reconnecting",
                    window
                );
                LinkAttempt::Retry(Duration::ZERO)
            }
            Verification::Stopped => LinkAttempt::Stopped,
        }
    }

    fn open_failed(&mut self) -> Duration {
        LinkStats::bump(&self.stats.open_failures);
        self.policy.open_backoff.next_delay()
    }

    /// Read until the first frame arrives, the decoder exits or the window closes
    fn verify(&self, reader: &mut dyn FrameReader, window: Duration) -> Verification {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if self.shutdown.is_cancelled() {
                return Verification::Stopped;
            }
            if let Some(frame) = reader.read() {
                return Verification::Frame(frame);
            }
            if reader.is_closed() {
                return Verification::Closed;
            }
        }
        if self.shutdown.is_cancelled() {
            Verification::Stopped
        } else {
            Verification::TimedOut
        }
    }

    /// Tight read loop; returns when the link has to be reopened or on shutdown
    fn stream(&self, reader: &mut dyn FrameReader) {
        let mut consecutive_failures = 0u32;

        while !self.shutdown.is_cancelled() {
            match reader.read() {
                Some(frame) => {
                    consecutive_failures = 0;
                    self.publish(frame);
                }
                None => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.policy.max_consecutive_read_failures {
                        LinkStats::bump(&self.stats.abandoned);
                        warn!(
                            camera = %self.camera,
                            "{} consecutive read failures, reopening source",
                            consecutive_failures
                        );
                        return;
                    }
                }
            }
        }
    }

    fn publish(&self, frame: Frame) {
        LinkStats::bump(&self.stats.frames);
        self.latest.store(frame);
    }
}

/// Result of one sampler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Motion gate closed, nothing reserved
    Paused,
    Completed(Timestamp),
    /// Register empty or stale; the reservation was withdrawn
    Withdrawn(Timestamp),
}

/// Samples the latest frame into the capture queue at a fixed period.
pub struct Sampler {
    camera: String,
    period: Duration,
    stale_after: Duration,
    latest: Arc<LatestFrame>,
    gate: MotionGate,
    captures: Arc<OrderedRendezvousQueue<Frame>>,
    shutdown: ShutdownSignal,
}

impl Sampler {
    /// One sampling step
    pub fn tick(&self) -> Result<SampleOutcome> {
        if !self.gate.is_open() {
            return Ok(SampleOutcome::Paused);
        }

        let timestamp = Timestamp::now();
        self.captures.reserve(timestamp);

        match self.latest.snapshot_with_age() {
            Some((mut frame, age)) if age <= self.stale_after => {
                trace!(camera = %self.camera, "Sampled frame captured at {}", frame.timestamp);
                frame.timestamp = timestamp;
                self.captures.complete(timestamp, frame)?;
                Ok(SampleOutcome::Completed(timestamp))
            }
            latest => {
                debug!(
                    camera = %self.camera,
                    "No fresh frame at {} (have frame: {}), withdrawing",
                    timestamp,
                    latest.is_some()
                );
                self.captures.withdraw(timestamp)?;
                Ok(SampleOutcome::Withdrawn(timestamp))
            }
        }
    }

    pub fn run(self) -> Result<()> {
        info!(camera = %self.camera, "Sampler started at {:?} per frame", self.period);

        let mut next_tick = Instant::now();
        while !self.shutdown.is_cancelled() {
            if let SampleOutcome::Paused = self.tick()? {
                if self.shutdown.sleep(GATE_POLL_INTERVAL) {
                    break;
                }
                next_tick = Instant::now();
                continue;
            }

            next_tick += self.period;
            let now = Instant::now();
            if next_tick <= now {
                // Fell behind; skip the missed ticks instead of bursting
                next_tick = now;
                continue;
            }
            if self.shutdown.sleep(next_tick - now) {
                break;
            }
        }

        info!(camera = %self.camera, "Sampler stopped");
        Ok(())
    }
}

/// Acquisition for one camera: a link maintainer and a sampler sharing a
/// latest-frame register.
pub struct StreamIngestor {
    camera: String,
    link: LinkMaintainer,
    sampler: Sampler,
    span: tracing::Span,
}

impl StreamIngestor {
    pub fn new(
        camera: &str,
        connector: Arc<dyn SourceConnector>,
        policy: LinkPolicy,
        fps: u32,
        captures: Arc<OrderedRendezvousQueue<Frame>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let latest = Arc::new(LatestFrame::new());
        let period = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));

        Self {
            camera: camera.to_string(),
            sampler: Sampler {
                camera: camera.to_string(),
                period,
                stale_after: policy.stale_after,
                latest: Arc::clone(&latest),
                gate: MotionGate::new(),
                captures,
                shutdown: shutdown.clone(),
            },
            link: LinkMaintainer {
                camera: camera.to_string(),
                connector,
                policy,
                latest,
                stats: Arc::new(LinkStats::default()),
                shutdown,
            },
            span: tracing::info_span!("camera", name = %camera),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn gate(&self) -> MotionGate {
        self.sampler.gate.clone()
    }

    pub fn latest(&self) -> Arc<LatestFrame> {
        Arc::clone(&self.sampler.latest)
    }

    pub fn link_stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.link.stats)
    }

    /// Split into the two threads; errors and panics go to `faults`
    pub fn spawn(self, faults: &FaultReporter) -> Result<Vec<JoinHandle<()>>> {
        let link = self.link;
        let link_span = self.span.clone();
        let link_handle = spawn_component(
            format!("link/{}", self.camera),
            faults.clone(),
            move || {
                let _guard = link_span.enter();
                link.run()
            },
        )?;

        let sampler = self.sampler;
        let sampler_span = self.span;
        let sampler_handle = spawn_component(
            format!("sampler/{}", self.camera),
            faults.clone(),
            move || {
                let _guard = sampler_span.enter();
                sampler.run()
            },
        )?;

        Ok(vec![link_handle, sampler_handle])
    }
}
