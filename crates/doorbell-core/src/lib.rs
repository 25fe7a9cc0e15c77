//! doorbell-core — Access control for a face-recognizing doorbell.
//!
//! Holds the door/bell state machine, the per-frame recognition loop that
//! drives it, Euclidean face matching with vote tallying, and the
//! hot-reloadable known-face store. Hardware lives behind the
//! [`Indicators`], [`FrameSource`] and [`FaceAnalyzer`] traits.

pub mod access;
pub mod frame;
pub mod matcher;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use access::{
    AccessController, AccessEvent, AccessEventKind, Actor, BellState, DoorState, EdgeEvent,
    Indicator, Indicators, PanelError,
};
pub use frame::{AnnotatedFrame, Frame};
pub use matcher::{DistanceMatcher, FaceLabel, Matcher, DEFAULT_TOLERANCE};
pub use store::{FaceStore, StoreDocument, StoreError};
pub use types::{BoundingBox, DetectedFace, Embedding, KnownFace, KnownFaceSet, UNKNOWN};
pub use worker::{
    Command, DoorbellStatus, FaceAnalyzer, FrameSource, Input, PresentationSink, Worker,
    WorkerConfig,
};

/// Default location of the known-face store (`$XDG_DATA_HOME/doorbell/faces.json`).
pub fn default_store_path() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("doorbell").join("faces.json")
}
