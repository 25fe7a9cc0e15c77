//! Presentation of processed frames.

use doorbell_core::{AnnotatedFrame, PresentationSink};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Writes the latest annotated frame as a PNG at most once per interval
/// and reports changes of the open-too-long warning.
pub struct SnapshotSink {
    path: Option<PathBuf>,
    interval: Duration,
    last_write: Option<Instant>,
    warning: bool,
}

impl SnapshotSink {
    pub fn new(path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last_write: None,
            warning: false,
        }
    }

    pub fn warning(&self) -> bool {
        self.warning
    }

    fn due(&self, now: Instant) -> bool {
        self.last_write
            .map_or(true, |last| now.duration_since(last) >= self.interval)
    }

    fn write_snapshot(path: &Path, annotated: &AnnotatedFrame) -> Result<(), image::ImageError> {
        let Some(img) = annotated.frame.to_image() else {
            tracing::debug!(seq = annotated.frame.sequence, "frame size mismatch; snapshot skipped");
            return Ok(());
        };
        // Write beside the target and rename so viewers never see a partial file.
        let tmp = path.with_extension("tmp.png");
        img.save_with_format(&tmp, image::ImageFormat::Png)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl PresentationSink for SnapshotSink {
    fn present(&mut self, frame: AnnotatedFrame, open_too_long: bool) {
        if open_too_long != self.warning {
            self.warning = open_too_long;
            if open_too_long {
                tracing::warn!("showing door-open warning");
            } else {
                tracing::info!("door-open warning removed");
            }
        }

        let Some(path) = self.path.as_deref() else {
            return;
        };
        let now = frame.frame.timestamp;
        if !self.due(now) {
            return;
        }
        self.last_write = Some(now);
        if let Err(e) = Self::write_snapshot(path, &frame) {
            tracing::warn!(error = %e, path = %path.display(), "snapshot write failed");
        }
    }
}
