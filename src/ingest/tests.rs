use super::*;
use crate::error::PipelineError;
use crate::fanout::BoundedFanoutQueue;
use crate::fault::FaultAggregator;
use crate::frame::InferenceResult;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::thread;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn test_frame(timestamp: Timestamp) -> Frame {
    Frame::new(timestamp, vec![0u8; Frame::expected_len(2, 2)], 2, 2)
}

fn fast_policy() -> LinkPolicy {
    LinkPolicy {
        open_backoff: Backoff::new(ms(5), 2, ms(20)),
        verify_timeout: Backoff::new(ms(30), 2, ms(60)),
        max_consecutive_read_failures: 5,
        stale_after: ms(1000),
    }
}

fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(ms(2));
    }
    condition()
}

/// What the next `connect` call does
enum Step {
    Refuse,
    /// Opens but never delivers a frame
    Silent,
    /// Delivers this many frames, then only failed reads
    Frames(usize),
    /// Opens, but the decoder exits before producing a frame
    Closed,
}

/// Connector that plays a script, then streams forever.
struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            connects: AtomicUsize::new(0),
        })
    }
}

impl SourceConnector for ScriptedConnector {
    fn connect(&self) -> Result<Box<dyn FrameReader>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.steps.lock().pop_front() {
            Some(Step::Refuse) => Err(PipelineError::Source {
                camera: "gate".to_string(),
                message: "connection refused".to_string(),
            }),
            Some(Step::Silent) => Ok(Box::new(ScriptedReader::new(Some(0)))),
            Some(Step::Frames(n)) => Ok(Box::new(ScriptedReader::new(Some(n)))),
            Some(Step::Closed) => Ok(Box::new(ScriptedReader {
                remaining: Some(0),
                closed: true,
            })),
            None => Ok(Box::new(ScriptedReader::new(None))),
        }
    }
}

struct ScriptedReader {
    /// `None` streams forever
    remaining: Option<usize>,
    closed: bool,
}

impl ScriptedReader {
    fn new(remaining: Option<usize>) -> Self {
        Self {
            remaining,
            closed: false,
        }
    }
}

impl FrameReader for ScriptedReader {
    fn read(&mut self) -> Option<Frame> {
        thread::sleep(ms(1));
        match self.remaining.as_mut() {
            None => Some(test_frame(Timestamp::now())),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(test_frame(Timestamp::now()))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn maintainer(
    connector: Arc<ScriptedConnector>,
    shutdown: &ShutdownSignal,
) -> (LinkMaintainer, Arc<LinkStats>, Arc<LatestFrame>) {
    let stats = Arc::new(LinkStats::default());
    let latest = Arc::new(LatestFrame::new());
    let maintainer = LinkMaintainer {
        camera: "gate".to_string(),
        connector,
        policy: fast_policy(),
        latest: Arc::clone(&latest),
        stats: Arc::clone(&stats),
        shutdown: shutdown.clone(),
    };
    (maintainer, stats, latest)
}

fn sampler(latest: Arc<LatestFrame>, shutdown: &ShutdownSignal) -> Sampler {
    Sampler {
        camera: "gate".to_string(),
        period: ms(10),
        stale_after: ms(1000),
        latest,
        gate: MotionGate::new(),
        captures: Arc::new(OrderedRendezvousQueue::new("captures/gate", shutdown.clone())),
        shutdown: shutdown.clone(),
    }
}

#[test]
fn test_link_retries_refused_opens() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new(vec![Step::Refuse, Step::Refuse, Step::Refuse]);
    let (link, stats, latest) = maintainer(Arc::clone(&connector), &shutdown);

    let handle = thread::spawn(move || link.run());
    assert!(wait_until(|| latest.snapshot().is_some(), Duration::from_secs(2)));

    assert_eq!(LinkStats::get(&stats.open_failures), 3);
    assert_eq!(LinkStats::get(&stats.opens), 1);

    shutdown.cancel();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_link_reopens_when_verification_times_out() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new(vec![Step::Silent]);
    let (link, stats, latest) = maintainer(Arc::clone(&connector), &shutdown);

    let handle = thread::spawn(move || link.run());
    assert!(wait_until(|| latest.snapshot().is_some(), Duration::from_secs(2)));

    assert_eq!(LinkStats::get(&stats.verify_failures), 1);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_link_abandoned_after_consecutive_read_failures() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new(vec![Step::Frames(3)]);
    let (link, stats, _latest) = maintainer(Arc::clone(&connector), &shutdown);

    let handle = thread::spawn(move || link.run());
    assert!(wait_until(
        || LinkStats::get(&stats.opens) >= 2,
        Duration::from_secs(2)
    ));

    assert_eq!(LinkStats::get(&stats.abandoned), 1);
    assert_eq!(LinkStats::get(&stats.verify_failures), 0);

    shutdown.cancel();
    assert!(handle.join().unwrap().is_ok());
}

#[test]
fn test_open_backoff_restarts_after_verified_open() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new(vec![
        Step::Refuse,
        Step::Refuse,
        Step::Refuse,
        Step::Frames(1),
        Step::Refuse,
    ]);
    let (mut link, stats, latest) = maintainer(connector, &shutdown);
    link.policy = LinkPolicy::from(&crate::config::LinkConfig::default());

    let mut waits = Vec::new();
    for _ in 0..3 {
        match link.attempt() {
            LinkAttempt::Retry(wait) => waits.push(wait.as_secs()),
            _ => panic!("refused open was not retried"),
        }
    }
    assert_eq!(waits, vec![10, 40, 160]);

    assert!(matches!(link.attempt(), LinkAttempt::Verified(_)));
    assert!(latest.snapshot().is_some());

    match link.attempt() {
        LinkAttempt::Retry(wait) => assert_eq!(wait, Duration::from_secs(10)),
        _ => panic!("refused open was not retried"),
    }
    assert_eq!(LinkStats::get(&stats.open_failures), 4);
    assert_eq!(LinkStats::get(&stats.opens), 1);
}

#[test]
fn test_decoder_exit_before_first_frame_backs_off() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new(vec![Step::Closed, Step::Closed]);
    let (mut link, stats, _latest) = maintainer(Arc::clone(&connector), &shutdown);

    let started = Instant::now();
    let first = link.attempt();
    let second = link.attempt();
    assert!(matches!(first, LinkAttempt::Retry(wait) if wait == ms(5)));
    assert!(matches!(second, LinkAttempt::Retry(wait) if wait == ms(10)));
    // Detected on exit, not after the verify window
    assert!(started.elapsed() < ms(50));

    assert!(matches!(link.attempt(), LinkAttempt::Verified(_)));
    assert_eq!(LinkStats::get(&stats.open_failures), 2);
    assert_eq!(LinkStats::get(&stats.opens), 3);
    assert_eq!(LinkStats::get(&stats.verify_failures), 0);
}

#[test]
fn test_link_stops_during_backoff() {
    let shutdown = ShutdownSignal::new();
    let connector = ScriptedConnector::new((0..100).map(|_| Step::Refuse).collect());
    let (mut link, _stats, _latest) = maintainer(connector, &shutdown);
    link.policy.open_backoff = Backoff::new(Duration::from_secs(60), 4, Duration::from_secs(600));

    let handle = thread::spawn(move || link.run());
    thread::sleep(ms(20));

    let stopped_at = Instant::now();
    shutdown.cancel();
    assert!(handle.join().unwrap().is_ok());
    assert!(stopped_at.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_sampler_withdraws_without_frame() {
    let shutdown = ShutdownSignal::new();
    let sampler = sampler(Arc::new(LatestFrame::new()), &shutdown);

    let outcome = sampler.tick().unwrap();
    assert!(matches!(outcome, SampleOutcome::Withdrawn(_)));
    assert_eq!(sampler.captures.pending_len(), 0);
    assert!(sampler.captures.is_empty());
}

#[test]
fn test_sampler_withdraws_stale_frame() {
    let shutdown = ShutdownSignal::new();
    let latest = Arc::new(LatestFrame::new());
    let stored_at = Instant::now().checked_sub(Duration::from_secs(5)).unwrap();
    latest.store_at(test_frame(Timestamp::now()), stored_at);

    let sampler = sampler(latest, &shutdown);
    assert!(matches!(sampler.tick().unwrap(), SampleOutcome::Withdrawn(_)));
    assert!(sampler.captures.is_empty());
    assert_eq!(crate::health::QueueView::stats(&*sampler.captures).withdrawn, 1);
}

#[test]
fn test_sampler_staleness_ignores_wall_clock_steps() {
    let shutdown = ShutdownSignal::new();
    let latest = Arc::new(LatestFrame::new());

    // Wall clock stepped back after the frame was decoded: its timestamp is
    // ahead of now, yet it has sat in the register for 5s
    let ahead = Timestamp::from_micros(Timestamp::now().as_micros() + 60_000_000);
    let stored_at = Instant::now().checked_sub(Duration::from_secs(5)).unwrap();
    latest.store_at(test_frame(ahead), stored_at);

    let sampler = sampler(Arc::clone(&latest), &shutdown);
    assert!(matches!(sampler.tick().unwrap(), SampleOutcome::Withdrawn(_)));

    // Wall clock jumped forward: the frame looks old but just arrived
    let behind = Timestamp::from_micros(Timestamp::now().as_micros() - 60_000_000);
    latest.store(test_frame(behind));
    assert!(matches!(sampler.tick().unwrap(), SampleOutcome::Completed(_)));
}

#[test]
fn test_sampler_completes_fresh_frame_with_sample_time() {
    let shutdown = ShutdownSignal::new();
    let latest = Arc::new(LatestFrame::new());
    latest.store(test_frame(Timestamp::now()));

    let sampler = sampler(latest, &shutdown);
    let outcome = sampler.tick().unwrap();
    let sampled_at = match outcome {
        SampleOutcome::Completed(ts) => ts,
        other => panic!("unexpected outcome {:?}", other),
    };

    let (timestamp, frame) = sampler.captures.try_take().unwrap();
    assert_eq!(timestamp, sampled_at);
    assert_eq!(frame.timestamp, sampled_at);
}

#[test]
fn test_closed_gate_reserves_nothing() {
    let shutdown = ShutdownSignal::new();
    let latest = Arc::new(LatestFrame::new());
    latest.store(test_frame(Timestamp::now()));
    let sampler = sampler(latest, &shutdown);

    sampler.gate.pause();
    for _ in 0..5 {
        assert_eq!(sampler.tick().unwrap(), SampleOutcome::Paused);
    }
    assert_eq!(crate::health::QueueView::stats(&*sampler.captures).pushed, 0);

    sampler.gate.resume();
    assert!(matches!(sampler.tick().unwrap(), SampleOutcome::Completed(_)));
}

#[test]
fn test_ingestor_feeds_captures_in_order() {
    let shutdown = ShutdownSignal::new();
    let aggregator = FaultAggregator::new();
    let captures = Arc::new(OrderedRendezvousQueue::new("captures/gate", shutdown.clone()));
    let ingestor = StreamIngestor::new(
        "gate",
        ScriptedConnector::new(vec![]),
        fast_policy(),
        50,
        Arc::clone(&captures),
        shutdown.clone(),
    );
    let gate = ingestor.gate();
    assert!(gate.is_open());

    let handles = ingestor.spawn(&aggregator.reporter()).unwrap();
    assert!(wait_until(|| captures.len() >= 5, Duration::from_secs(3)));

    let stamps: Vec<Timestamp> = (0..5)
        .filter_map(|_| captures.try_take().map(|(ts, _)| ts))
        .collect();
    assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));

    shutdown.cancel();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!aggregator.reporter().is_claimed());
}

#[test]
fn test_dispatcher_withdraws_evicted_reservations() {
    let shutdown = ShutdownSignal::new();
    let captures = Arc::new(OrderedRendezvousQueue::new("captures/gate", shutdown.clone()));
    let results: Arc<OrderedRendezvousQueue<InferenceResult>> =
        Arc::new(OrderedRendezvousQueue::new("results/gate/person", shutdown.clone()));
    let lane = Arc::new(BoundedFanoutQueue::new("gate/person", 2, shutdown.clone()));

    let dispatcher = CaptureDispatcher::new(
        "gate",
        captures,
        vec![ModelRoute {
            model: "person".to_string(),
            lane: Arc::clone(&lane),
            results: Arc::clone(&results),
        }],
    );

    for t in 1..=4 {
        let ts = Timestamp::from_micros(t);
        dispatcher.dispatch(ts, test_frame(ts)).unwrap();
    }

    assert_eq!(lane.len(), 2);
    assert_eq!(results.pending_len(), 2);
    assert_eq!(crate::health::QueueView::stats(&*results).withdrawn, 2);

    while let Some(job) = lane.try_pop() {
        job.results
            .complete(
                job.timestamp,
                InferenceResult {
                    frame: job.frame,
                    detections: Vec::new(),
                },
            )
            .unwrap();
    }

    let released: Vec<i64> = std::iter::from_fn(|| results.try_take())
        .map(|(ts, _)| ts.as_micros())
        .collect();
    assert_eq!(released, vec![3, 4]);
}

#[test]
fn test_dispatcher_fans_out_to_every_model() {
    let shutdown = ShutdownSignal::new();
    let captures = Arc::new(OrderedRendezvousQueue::new("captures/gate", shutdown.clone()));
    let routes: Vec<ModelRoute> = ["person", "helmet"]
        .iter()
        .map(|model| ModelRoute {
            model: model.to_string(),
            lane: Arc::new(BoundedFanoutQueue::new(format!("gate/{}", model), 8, shutdown.clone())),
            results: Arc::new(OrderedRendezvousQueue::new(
                format!("results/gate/{}", model),
                shutdown.clone(),
            )),
        })
        .collect();

    let dispatcher = CaptureDispatcher::new("gate", Arc::clone(&captures), routes.clone());
    let runner = thread::spawn(move || dispatcher.run());

    let ts = Timestamp::from_micros(10);
    captures.reserve(ts);
    captures.complete(ts, test_frame(ts)).unwrap();

    for route in &routes {
        assert!(wait_until(|| route.lane.len() == 1, Duration::from_secs(2)));
        assert_eq!(route.results.pending_len(), 1);
    }

    shutdown.cancel();
    assert!(runner.join().unwrap().is_ok());
}
