//! Periodic capture-and-recognize loop.
//!
//! The scheduler runs as a tokio task and is driven through a clone-safe
//! handle. Each cycle borrows the frame source, captures one frame and
//! submits it; at most one cycle is in flight. Stopping bumps a generation
//! counter so a late result is discarded instead of reaching the tracker.

use crate::client::Recognizer;
use faceattend_core::{
    AttendanceEvent, NotificationQueue, PresenceTracker, SubmitFailure, SubmitOutcome,
    TrackerConfig,
};
use faceattend_hw::{CaptureError, FrameSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};

/// Shortest accepted capture interval.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler task exited")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No cycle in flight. `running` tells whether the timer is armed.
    Idle,
    /// A capture-and-recognize cycle is in flight.
    Capturing,
    /// The last cycle failed. Cleared by the next tick or by `stop`.
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub running: bool,
    #[serde(with = "millis")]
    pub interval: Duration,
    pub cycles_completed: u64,
    /// Ticks that fired while a cycle was still in flight.
    pub ticks_dropped: u64,
    pub tracked: usize,
    pub present: usize,
    pub last_error: Option<String>,
    /// Texts of notifications that have not expired yet.
    pub notifications: Vec<String>,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Everything the loop reports to its owner.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Attendance(AttendanceEvent),
    CycleCompleted {
        recognized: usize,
        unrecognized: u32,
        total_faces: u32,
        processing_time_ms: f64,
    },
    CaptureFailed {
        message: String,
        fatal: bool,
    },
    RecognitionFailed(SubmitFailure),
    Stopped {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub tracker: TrackerConfig,
    pub notification_ttl: Duration,
    pub notification_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            notification_ttl: faceattend_core::notifications::DEFAULT_NOTIFICATION_TTL,
            notification_capacity: faceattend_core::notifications::DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

enum Command {
    Start {
        interval: Duration,
        reply: oneshot::Sender<Duration>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SetInterval {
        interval: Duration,
        reply: oneshot::Sender<Duration>,
    },
    Status {
        reply: oneshot::Sender<SchedulerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SchedulerError::ChannelClosed)?;
        rx.await.map_err(|_| SchedulerError::ChannelClosed)
    }

    /// Capture now and then every `interval`. Returns the effective interval.
    pub async fn start(&self, interval: Duration) -> Result<Duration, SchedulerError> {
        self.request(|reply| Command::Start { interval, reply }).await
    }

    /// Stop capturing and release the frame source.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Change the interval, restarting the timer. Tracker state is kept.
    pub async fn set_interval(&self, interval: Duration) -> Result<Duration, SchedulerError> {
        self.request(|reply| Command::SetInterval { interval, reply })
            .await
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop, wait for any in-flight cycle, release the source and end the task.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

enum CycleOutcome {
    Capture(CaptureError),
    Submitted(SubmitOutcome),
}

struct CycleDone {
    source: Box<dyn FrameSource>,
    generation: u64,
    outcome: CycleOutcome,
}

/// The capture loop. Created with [`CaptureScheduler::spawn`].
pub struct CaptureScheduler {
    rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<SchedulerEvent>,
    source: Option<Box<dyn FrameSource>>,
    recognizer: Arc<dyn Recognizer>,
    tracker: PresenceTracker,
    notifications: NotificationQueue,
    ticker: Option<Interval>,
    interval: Duration,
    in_flight: Option<JoinHandle<CycleDone>>,
    generation: u64,
    state: SchedulerState,
    running: bool,
    release_pending: bool,
    cycles_completed: u64,
    ticks_dropped: u64,
    last_error: Option<String>,
}

impl CaptureScheduler {
    /// Spawn the loop. The scheduler starts idle; call `start` on the handle.
    pub fn spawn(
        source: Box<dyn FrameSource>,
        recognizer: Arc<dyn Recognizer>,
        config: SchedulerConfig,
    ) -> (SchedulerHandle, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let (events, events_rx) = mpsc::channel(64);
        let scheduler = Self {
            rx,
            events,
            source: Some(source),
            recognizer,
            tracker: PresenceTracker::new(config.tracker),
            notifications: NotificationQueue::new(
                config.notification_ttl,
                config.notification_capacity,
            ),
            ticker: None,
            interval: DEFAULT_INTERVAL,
            in_flight: None,
            generation: 0,
            state: SchedulerState::Idle,
            running: false,
            release_pending: false,
            cycles_completed: 0,
            ticks_dropped: 0,
            last_error: None,
        };
        tokio::spawn(scheduler.run());
        (SchedulerHandle { tx }, events_rx)
    }

    async fn run(mut self) {
        tracing::info!("capture scheduler started");
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.halt("all handles dropped").await;
                        break;
                    };
                    if self.handle(cmd).await {
                        break;
                    }
                }
                _ = next_tick(&mut self.ticker) => self.on_tick(),
                done = join_cycle(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_cycle_done(done).await;
                }
            }
        }
        tracing::info!("capture scheduler exiting");
    }

    /// Returns true when the loop should exit.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { interval, reply } => {
                let interval = clamp_interval(interval);
                self.interval = interval;
                if !self.running {
                    self.running = true;
                    self.state = SchedulerState::Idle;
                    self.last_error = None;
                    self.release_pending = false;
                    self.ticker = Some(new_ticker(tokio::time::Instant::now(), interval));
                    tracing::info!(
                        interval_ms = interval.as_millis() as u64,
                        "capture started"
                    );
                }
                let _ = reply.send(interval);
            }
            Command::Stop { reply } => {
                if self.running {
                    self.stop("stopped").await;
                }
                self.state = SchedulerState::Idle;
                let _ = reply.send(());
            }
            Command::SetInterval { interval, reply } => {
                let interval = clamp_interval(interval);
                self.interval = interval;
                if self.running {
                    let first = tokio::time::Instant::now() + interval;
                    self.ticker = Some(new_ticker(first, interval));
                    tracing::info!(
                        interval_ms = interval.as_millis() as u64,
                        "capture interval changed"
                    );
                }
                let _ = reply.send(interval);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.halt("shutdown").await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    /// Stop for good: wait out the in-flight cycle, then release the source.
    async fn halt(&mut self, reason: &str) {
        if self.running {
            self.stop(reason).await;
        }
        if let Some(handle) = self.in_flight.take() {
            if let Ok(done) = handle.await {
                self.source = Some(done.source);
            }
        }
        self.release_source().await;
        self.state = SchedulerState::Idle;
    }

    async fn stop(&mut self, reason: &str) {
        self.ticker = None;
        self.running = false;
        self.generation += 1;
        if self.in_flight.is_some() {
            self.release_pending = true;
        } else {
            self.release_source().await;
        }
        tracing::info!(reason, "capture stopped");
        self.emit(SchedulerEvent::Stopped {
            reason: reason.to_string(),
        });
    }

    async fn release_source(&mut self) {
        self.release_pending = false;
        if let Some(source) = self.source.as_mut() {
            source.release().await;
        }
    }

    fn on_tick(&mut self) {
        if self.in_flight.is_some() {
            self.ticks_dropped += 1;
            tracing::debug!(
                dropped = self.ticks_dropped,
                "previous cycle still running; tick dropped"
            );
            return;
        }
        let Some(mut source) = self.source.take() else {
            return;
        };
        self.state = SchedulerState::Capturing;

        let recognizer = self.recognizer.clone();
        let generation = self.generation;
        self.in_flight = Some(tokio::spawn(async move {
            let outcome = match source.capture_frame().await {
                Ok(frame) => CycleOutcome::Submitted(recognizer.submit_frame(frame.jpeg).await),
                Err(e) => CycleOutcome::Capture(e),
            };
            CycleDone {
                source,
                generation,
                outcome,
            }
        }));
    }

    async fn on_cycle_done(&mut self, done: Result<CycleDone, JoinError>) {
        let done = match done {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "capture cycle panicked; frame source lost");
                self.state = SchedulerState::Error;
                self.last_error = Some("capture cycle panicked".into());
                self.emit(SchedulerEvent::CaptureFailed {
                    message: e.to_string(),
                    fatal: true,
                });
                if self.running {
                    self.stop("frame source lost").await;
                }
                return;
            }
        };

        self.source = Some(done.source);
        if done.generation != self.generation {
            tracing::debug!("discarding result of a cancelled cycle");
            if self.release_pending {
                self.release_source().await;
            } else if self.running {
                // Restarted while the old cycle held the source; its
                // immediate tick was dropped, so capture now.
                self.on_tick();
            }
            return;
        }
        self.cycles_completed += 1;

        match done.outcome {
            CycleOutcome::Capture(e) => {
                let fatal = e.is_fatal();
                tracing::warn!(error = %e, fatal, "frame capture failed");
                self.state = SchedulerState::Error;
                self.last_error = Some(format!("{e}. {}", e.user_message()));
                self.emit(SchedulerEvent::CaptureFailed {
                    message: e.to_string(),
                    fatal,
                });
                if fatal {
                    self.stop(&e.to_string()).await;
                }
            }
            CycleOutcome::Submitted(SubmitOutcome::Failed(failure)) => {
                self.state = SchedulerState::Error;
                self.last_error = Some(failure.message.clone());
                self.emit(SchedulerEvent::RecognitionFailed(failure));
            }
            CycleOutcome::Submitted(SubmitOutcome::Recognized(result)) => {
                self.state = SchedulerState::Idle;
                self.last_error = None;
                let now = Instant::now();
                let events = self.tracker.observe(&result.observations, now);
                self.notifications.drain_expired(now);
                self.notifications.push(events.iter().cloned(), now);

                self.emit(SchedulerEvent::CycleCompleted {
                    recognized: result.recognized_count(),
                    unrecognized: result.unrecognized_count,
                    total_faces: result.total_faces,
                    processing_time_ms: result.processing_time_ms,
                });
                for event in events {
                    tracing::debug!(
                        subject = %event.subject.id,
                        kind = event.kind.as_str(),
                        "{}",
                        event.text
                    );
                    self.emit(SchedulerEvent::Attendance(event));
                }
            }
        }
    }

    fn status(&self) -> SchedulerStatus {
        let now = Instant::now();
        SchedulerStatus {
            state: self.state,
            running: self.running,
            interval: self.interval,
            cycles_completed: self.cycles_completed,
            ticks_dropped: self.ticks_dropped,
            tracked: self.tracker.len(),
            present: self.tracker.present_count(),
            last_error: self.last_error.clone(),
            notifications: self
                .notifications
                .active(now)
                .map(|n| n.text().to_string())
                .collect(),
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!(?event, "event receiver lagging; event dropped");
        }
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.max(MIN_INTERVAL)
}

fn new_ticker(start: tokio::time::Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn join_cycle(
    in_flight: &mut Option<JoinHandle<CycleDone>>,
) -> Result<CycleDone, JoinError> {
    match in_flight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
