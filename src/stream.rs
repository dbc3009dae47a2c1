//! Per-session packet sample stream: a time-windowed ring buffer with
//! synchronous filter stages and throttled batch observers.
//!
//! All mutation happens on one serial executor (the stream's worker task);
//! callers interact through message passing, so appends from the parser path
//! never block.

use crate::logger::{self, BreadcrumbFlags};
use crate::sample::PacketSample;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

pub const MIN_BUFFER_DURATION: Duration = Duration::from_secs(5);
pub const MAX_BUFFER_DURATION: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_SAMPLES: usize = 8000;

pub type StagePredicate = Box<dyn Fn(&PacketSample) -> bool + Send>;
pub type StageHandler = Box<dyn Fn(&PacketSample) + Send>;
pub type BatchHandler = Box<dyn Fn(&[PacketSample]) + Send>;

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub buffer_duration: Duration,
    pub max_samples: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_duration: Duration::from_secs(60),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

impl StreamConfig {
    fn clamped(self) -> Self {
        Self {
            buffer_duration: self
                .buffer_duration
                .clamp(MIN_BUFFER_DURATION, MAX_BUFFER_DURATION),
            max_samples: self.max_samples.max(1),
        }
    }
}

struct Stage {
    predicate: StagePredicate,
    handler: StageHandler,
}

struct BatchObserver {
    name: String,
    interval: Duration,
    last_fired: Option<Instant>,
    handler: BatchHandler,
}

/// The synchronous core: ring buffer, stages, and observers. Owned by the
/// stream worker; exercised directly by tests.
pub struct SampleStreamCore {
    config: StreamConfig,
    samples: VecDeque<PacketSample>,
    stages: Vec<Stage>,
    observers: Vec<BatchObserver>,
}

impl SampleStreamCore {
    pub fn new(config: StreamConfig) -> Self {
        let config = config.clamped();
        Self {
            config,
            samples: VecDeque::with_capacity(config.max_samples.min(1024)),
            stages: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Appends in parser order: evicts expired samples from the head, runs
    /// every matching stage synchronously, then fires due batch observers.
    pub fn append(&mut self, sample: PacketSample, now: Instant) {
        let window_ns = self.config.buffer_duration.as_nanos().min(u64::MAX as u128) as u64;
        let horizon = sample.timestamp_ns.saturating_sub(window_ns);
        while let Some(front) = self.samples.front() {
            if front.timestamp_ns < horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() >= self.config.max_samples {
            self.samples.pop_front();
        }
        for stage in &self.stages {
            if (stage.predicate)(&sample) {
                (stage.handler)(&sample);
            }
        }
        self.samples.push_back(sample);
        self.fire_due_observers(now);
    }

    fn fire_due_observers(&mut self, now: Instant) {
        for observer in &mut self.observers {
            let due = observer
                .last_fired
                .map(|fired| now.saturating_duration_since(fired) >= observer.interval)
                .unwrap_or(true);
            if due {
                observer.last_fired = Some(now);
                let snapshot: Vec<PacketSample> = self.samples.iter().cloned().collect();
                (observer.handler)(&snapshot);
            }
        }
    }

    pub fn add_stage(&mut self, predicate: StagePredicate, handler: StageHandler) {
        self.stages.push(Stage { predicate, handler });
    }

    pub fn add_batch_observer(&mut self, name: &str, interval: Duration, handler: BatchHandler) {
        logger::breadcrumb(
            BreadcrumbFlags::STREAM,
            format!("batch observer {name:?} every {interval:?}"),
        );
        self.observers.push(BatchObserver {
            name: name.to_string(),
            interval,
            last_fired: None,
            handler,
        });
    }

    pub fn remove_batch_observer(&mut self, name: &str) {
        self.observers.retain(|observer| observer.name != name);
    }

    pub fn snapshot(&self) -> Vec<PacketSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

enum Command {
    Append(Box<PacketSample>),
    AddStage(StagePredicate, StageHandler),
    AddBatchObserver(String, Duration, BatchHandler),
    RemoveBatchObserver(String),
    Snapshot(oneshot::Sender<Vec<PacketSample>>),
}

/// Handle to the stream's serial executor.
#[derive(Clone)]
pub struct SampleStream {
    tx: mpsc::UnboundedSender<Command>,
}

impl SampleStream {
    /// Spawns the worker on the given runtime handle.
    pub fn spawn(config: StreamConfig, runtime: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            let mut core = SampleStreamCore::new(config);
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Append(sample) => core.append(*sample, Instant::now()),
                    Command::AddStage(predicate, handler) => core.add_stage(predicate, handler),
                    Command::AddBatchObserver(name, interval, handler) => {
                        core.add_batch_observer(&name, interval, handler)
                    }
                    Command::RemoveBatchObserver(name) => core.remove_batch_observer(&name),
                    Command::Snapshot(reply) => {
                        let _ = reply.send(core.snapshot());
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn append(&self, sample: PacketSample) {
        let _ = self.tx.send(Command::Append(Box::new(sample)));
    }

    pub fn add_stage(&self, predicate: StagePredicate, handler: StageHandler) {
        let _ = self.tx.send(Command::AddStage(predicate, handler));
    }

    pub fn add_batch_observer(&self, name: &str, interval: Duration, handler: BatchHandler) {
        let _ = self
            .tx
            .send(Command::AddBatchObserver(name.to_string(), interval, handler));
    }

    pub fn remove_batch_observer(&self, name: &str) {
        let _ = self.tx.send(Command::RemoveBatchObserver(name.to_string()));
    }

    /// Copies the current buffer back to the caller's executor.
    pub async fn snapshot(&self) -> Vec<PacketSample> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{IpVersion, Transport};
    use crate::sample::Direction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn sample(flow_id: u64, timestamp_ns: u64) -> PacketSample {
        PacketSample {
            timestamp_ns,
            direction: Direction::Outbound,
            ip_version: IpVersion::V4,
            transport: Transport::Udp,
            byte_count: 100,
            flow_id,
            burst_id: 1,
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            dns: None,
            tls_server_name: None,
            quic: None,
            burst: None,
            classification: None,
        }
    }

    #[test]
    fn ring_caps_sample_count() {
        let mut core = SampleStreamCore::new(StreamConfig {
            buffer_duration: Duration::from_secs(60),
            max_samples: 3,
        });
        let now = Instant::now();
        for id in 1..=4u64 {
            core.append(sample(id, id), now);
        }
        let ids: Vec<u64> = core.snapshot().iter().map(|s| s.flow_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn ring_evicts_samples_older_than_the_window() {
        let mut core = SampleStreamCore::new(StreamConfig {
            buffer_duration: Duration::from_secs(5),
            max_samples: 100,
        });
        let now = Instant::now();
        let second = 1_000_000_000u64;
        core.append(sample(1, second), now);
        core.append(sample(2, 2 * second), now);
        // 10 s later: both earlier samples fall outside the 5 s window.
        core.append(sample(3, 12 * second), now);
        let ids: Vec<u64> = core.snapshot().iter().map(|s| s.flow_id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn buffer_duration_is_clamped_to_bounds() {
        let core = SampleStreamCore::new(StreamConfig {
            buffer_duration: Duration::from_secs(1),
            max_samples: 10,
        });
        assert_eq!(core.config.buffer_duration, MIN_BUFFER_DURATION);
        let core = SampleStreamCore::new(StreamConfig {
            buffer_duration: Duration::from_secs(10_000),
            max_samples: 10,
        });
        assert_eq!(core.config.buffer_duration, MAX_BUFFER_DURATION);
    }

    #[test]
    fn stages_see_samples_in_arrival_order() {
        let mut core = SampleStreamCore::new(StreamConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_probe = Arc::clone(&seen);
        core.add_stage(
            Box::new(|sample| sample.flow_id % 2 == 0),
            Box::new(move |sample| seen_probe.lock().unwrap().push(sample.flow_id)),
        );
        let now = Instant::now();
        for id in 1..=6u64 {
            core.append(sample(id, id), now);
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn batch_observers_are_throttled_by_interval() {
        let mut core = SampleStreamCore::new(StreamConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_probe = Arc::clone(&fired);
        core.add_batch_observer(
            "counter",
            Duration::from_secs(10),
            Box::new(move |batch| {
                assert!(!batch.is_empty());
                fired_probe.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let start = Instant::now();
        core.append(sample(1, 1), start);
        core.append(sample(2, 2), start + Duration::from_secs(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "second append throttled");
        core.append(sample(3, 3), start + Duration::from_secs(11));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stream_snapshot_round_trips_through_the_executor() {
        let stream = SampleStream::spawn(StreamConfig::default(), &tokio::runtime::Handle::current());
        stream.append(sample(1, 1));
        stream.append(sample(2, 2));
        // Give the worker a turn before snapshotting.
        tokio::task::yield_now().await;
        let snapshot = stream.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].flow_id, 1);
    }
}
