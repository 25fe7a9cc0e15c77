//! In-memory collaborators for unit tests.

use crate::access::{Indicator, Indicators, PanelError};
use crate::frame::{AnnotatedFrame, Frame};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use crate::worker::{FaceAnalyzer, FrameSource, PresentationSink};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("scripted failure")]
pub struct FakeError;

/// Panel that remembers the last value of every indicator.
#[derive(Default)]
pub struct RecordingPanel {
    pub state: HashMap<Indicator, bool>,
    pub writes: Vec<(Indicator, bool)>,
    pub fail_writes: bool,
}

impl RecordingPanel {
    pub fn is_on(&self, indicator: Indicator) -> bool {
        self.state.get(&indicator).copied().unwrap_or(false)
    }
}

impl Indicators for RecordingPanel {
    fn set_indicator(&mut self, indicator: Indicator, on: bool) -> Result<(), PanelError> {
        if self.fail_writes {
            return Err(PanelError::Write {
                indicator,
                source: std::io::Error::other("gpio unavailable"),
            });
        }
        self.writes.push((indicator, on));
        self.state.insert(indicator, on);
        Ok(())
    }
}

pub fn blank_frame(sequence: u32) -> Frame {
    Frame {
        data: vec![0; 16 * 16],
        width: 16,
        height: 16,
        timestamp: std::time::Instant::now(),
        sequence,
    }
}

/// Plays back queued results, then yields blank frames forever.
#[derive(Default)]
pub struct ScriptedSource {
    pub frames: VecDeque<Result<Frame, FakeError>>,
    pub served: u32,
    pub released: bool,
}

impl FrameSource for ScriptedSource {
    type Error = FakeError;

    fn next_frame(&mut self) -> Result<Frame, FakeError> {
        self.served += 1;
        self.frames
            .pop_front()
            .unwrap_or_else(|| Ok(blank_frame(self.served)))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Plays back queued detections, then reports no faces.
#[derive(Default)]
pub struct ScriptedAnalyzer {
    pub results: VecDeque<Result<Vec<DetectedFace>, FakeError>>,
    pub calls: usize,
}

impl ScriptedAnalyzer {
    pub fn with(results: Vec<Result<Vec<DetectedFace>, FakeError>>) -> Self {
        Self {
            results: results.into(),
            calls: 0,
        }
    }
}

impl FaceAnalyzer for ScriptedAnalyzer {
    type Error = FakeError;

    fn detect_and_embed(&mut self, _frame: &Frame) -> Result<Vec<DetectedFace>, FakeError> {
        self.calls += 1;
        self.results.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[derive(Default)]
pub struct CollectingSink {
    pub presented: Vec<(AnnotatedFrame, bool)>,
}

impl PresentationSink for CollectingSink {
    fn present(&mut self, frame: AnnotatedFrame, open_too_long: bool) {
        self.presented.push((frame, open_too_long));
    }
}

/// A detected region whose embedding is `[v, v]`.
pub fn region(v: f32) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox { x: 2.0, y: 2.0, width: 8.0, height: 8.0 },
        embedding: Embedding::new(vec![v, v]),
    }
}
