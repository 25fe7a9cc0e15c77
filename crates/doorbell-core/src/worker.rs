//! The access-control loop.
//!
//! One [`Worker`] owns the controller, the frame source, the analyzer and
//! the presentation sink. Edge events and admin commands arrive on a single
//! unbounded queue and are applied at a fixed point of every iteration:
//!
//! 1. hot-reload check of the known-face store
//! 2. drain and apply queued inputs
//! 3. timer sweep
//! 4. frame acquisition, recognition while the bell rings
//! 5. present the annotated frame and the open-too-long flag
//!
//! The worker is the only mutator of access-control state.

use crate::access::{
    AccessController, AccessEvent, Actor, BellState, DoorState, EdgeEvent, Indicators,
};
use crate::frame::{AnnotatedFrame, Frame};
use crate::matcher::{recognize, DistanceMatcher, FaceLabel, DEFAULT_TOLERANCE};
use crate::store::{FaceStore, StoreError};
use crate::types::{DetectedFace, KnownFaceSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// Access events retained for the history view.
pub const HISTORY_CAPACITY: usize = 100;

/// Continuous source of camera frames. `next_frame` may block for up to
/// one frame interval.
pub trait FrameSource {
    type Error: std::error::Error;

    fn next_frame(&mut self) -> Result<Frame, Self::Error>;

    /// Stop streaming and free the device.
    fn release(&mut self);
}

/// Opaque face detection + embedding capability.
pub trait FaceAnalyzer {
    type Error: std::error::Error;

    fn detect_and_embed(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, Self::Error>;
}

/// Receives every processed frame.
pub trait PresentationSink {
    fn present(&mut self, frame: AnnotatedFrame, open_too_long: bool);
}

/// Admin commands, answered through a oneshot reply.
#[derive(Debug)]
pub enum Command {
    ForceUnlock { reply: oneshot::Sender<bool> },
    SilenceBell { reply: oneshot::Sender<bool> },
    Reset { reply: oneshot::Sender<()> },
    ReloadFaces { reply: oneshot::Sender<Result<usize, StoreError>> },
}

/// Everything that mutates access-control state from outside the loop.
#[derive(Debug)]
pub enum Input {
    Edge(EdgeEvent),
    Command(Command),
}

/// Point-in-time view published after every iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoorbellStatus {
    pub door: DoorState,
    pub bell: BellState,
    pub current_identity: String,
    pub open_too_long: bool,
    pub known_embeddings: usize,
    pub known_users: usize,
    pub frames_processed: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Euclidean distance tolerance for a positive match.
    pub tolerance: f32,
    /// Pause after a failed frame capture.
    pub capture_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            capture_backoff: Duration::from_millis(100),
        }
    }
}

pub struct Worker<S, A, P, K>
where
    S: FrameSource,
    A: FaceAnalyzer,
    P: Indicators,
    K: PresentationSink,
{
    controller: AccessController<P>,
    source: S,
    analyzer: A,
    sink: K,
    store: FaceStore,
    known: Arc<KnownFaceSet>,
    matcher: DistanceMatcher,
    inputs: mpsc::UnboundedReceiver<Input>,
    config: WorkerConfig,
    open_too_long: bool,
    frames_processed: u64,
    status: watch::Sender<DoorbellStatus>,
    history: watch::Sender<VecDeque<AccessEvent>>,
}

impl<S, A, P, K> Worker<S, A, P, K>
where
    S: FrameSource,
    A: FaceAnalyzer,
    P: Indicators,
    K: PresentationSink,
{
    /// Build a worker around an initialized panel. The known-face store is
    /// loaded immediately; a broken store starts the worker with no known
    /// faces and is retried on the next modification.
    pub fn new(
        panel: P,
        source: S,
        analyzer: A,
        sink: K,
        mut store: FaceStore,
        inputs: mpsc::UnboundedReceiver<Input>,
        config: WorkerConfig,
    ) -> Self {
        let known = match store.load() {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(error = %e, "could not load face store; starting with no known faces");
                KnownFaceSet::default()
            }
        };
        tracing::info!(
            path = %store.path().display(),
            embeddings = known.len(),
            users = known.names().len(),
            "known faces loaded"
        );

        let controller = AccessController::new(panel);
        let (status, _) = watch::channel(snapshot(&controller, &known, false, 0));
        let (history, _) = watch::channel(VecDeque::with_capacity(HISTORY_CAPACITY));

        let mut worker = Self {
            controller,
            source,
            analyzer,
            sink,
            store,
            known: Arc::new(known),
            matcher: DistanceMatcher,
            inputs,
            config,
            open_too_long: false,
            frames_processed: 0,
            status,
            history,
        };
        worker.flush_events();
        worker
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DoorbellStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<VecDeque<AccessEvent>> {
        self.history.subscribe()
    }

    pub fn controller(&self) -> &AccessController<P> {
        &self.controller
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn known_faces(&self) -> Arc<KnownFaceSet> {
        Arc::clone(&self.known)
    }

    /// Loop until `stop` is set, then lock the door and release the camera.
    pub fn run(&mut self, stop: &AtomicBool) {
        tracing::info!("access-control loop started");
        while !stop.load(Ordering::Acquire) {
            self.step(Instant::now());
        }
        self.shutdown();
    }

    /// One iteration of the loop at time `now`.
    pub fn step(&mut self, now: Instant) {
        self.poll_store();
        self.drain_inputs(now);
        self.sweep(now);

        match self.source.next_frame() {
            Ok(frame) => {
                let labels = if self.controller.is_ringing() {
                    self.recognize(&frame, now)
                } else {
                    Vec::new()
                };
                self.frames_processed += 1;
                self.sink
                    .present(AnnotatedFrame::new(frame, labels), self.open_too_long);
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                if !self.config.capture_backoff.is_zero() {
                    std::thread::sleep(self.config.capture_backoff);
                }
            }
        }

        self.publish();
    }

    /// Leave the outputs locked and free the frame source.
    pub fn shutdown(&mut self) {
        tracing::info!("access-control loop stopping; locking door");
        self.controller.lock(Actor::System);
        self.source.release();
        self.publish();
    }

    fn poll_store(&mut self) {
        match self.store.poll() {
            Ok(Some(set)) => self.swap_known(set),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "face store reload failed; keeping previous faces"),
        }
    }

    fn swap_known(&mut self, set: KnownFaceSet) {
        tracing::info!(embeddings = set.len(), users = set.names().len(), "known faces replaced");
        self.known = Arc::new(set);
    }

    fn drain_inputs(&mut self, now: Instant) {
        while let Ok(input) = self.inputs.try_recv() {
            match input {
                Input::Edge(edge) => {
                    tracing::debug!(?edge, "edge event");
                    self.controller.apply_edge(edge, now);
                }
                Input::Command(command) => self.apply_command(command, now),
            }
        }
    }

    /// Replies are sent after the resulting state is published, so a caller
    /// that reads the status once answered sees the effect of its command.
    fn apply_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::ForceUnlock { reply } => {
                let unlocked = self.controller.force_unlock(now);
                if !unlocked {
                    tracing::info!(actor = %Actor::Admin, "force unlock ignored; bell is idle");
                }
                self.publish();
                let _ = reply.send(unlocked);
            }
            Command::SilenceBell { reply } => {
                let silenced = self.controller.silence_bell(Actor::Admin);
                self.publish();
                let _ = reply.send(silenced);
            }
            Command::Reset { reply } => {
                self.controller.reset();
                self.publish();
                let _ = reply.send(());
            }
            Command::ReloadFaces { reply } => {
                let result = self.store.load().map(|set| {
                    let len = set.len();
                    self.swap_known(set);
                    len
                });
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "requested face reload failed");
                }
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        let open_too_long = self.controller.sweep(now);
        if open_too_long != self.open_too_long {
            if open_too_long {
                tracing::warn!("door open too long");
            } else {
                tracing::info!("open-too-long warning cleared");
            }
        }
        self.open_too_long = open_too_long;
    }

    /// Detect, match and feed the frame identity to the controller.
    /// Analyzer failure counts as a frame without faces.
    fn recognize(&mut self, frame: &Frame, now: Instant) -> Vec<FaceLabel> {
        let faces = match self.analyzer.detect_and_embed(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "face analysis failed; skipping frame");
                return Vec::new();
            }
        };

        let known = Arc::clone(&self.known);
        let result = recognize(&self.matcher, &faces, &known, self.config.tolerance);
        if let Some(identity) = &result.identity {
            self.controller.observe_identity(identity, now);
        }
        result.labels
    }

    fn publish(&mut self) {
        self.flush_events();
        self.publish_status();
    }

    fn flush_events(&mut self) {
        let events = self.controller.drain_events();
        if events.is_empty() {
            return;
        }
        self.history.send_modify(|history| {
            for event in events {
                if history.len() == HISTORY_CAPACITY {
                    history.pop_front();
                }
                history.push_back(event);
            }
        });
    }

    fn publish_status(&mut self) {
        let status = snapshot(
            &self.controller,
            &self.known,
            self.open_too_long,
            self.frames_processed,
        );
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn snapshot<P: Indicators>(
    controller: &AccessController<P>,
    known: &KnownFaceSet,
    open_too_long: bool,
    frames_processed: u64,
) -> DoorbellStatus {
    DoorbellStatus {
        door: controller.door(),
        bell: controller.bell(),
        current_identity: controller.current_identity().to_string(),
        open_too_long,
        known_embeddings: known.len(),
        known_users: known.names().len(),
        frames_processed,
    }
}
