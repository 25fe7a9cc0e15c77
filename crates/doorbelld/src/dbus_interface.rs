use crate::engine::{EngineError, EngineHandle};
use doorbell_core::Actor;
use zbus::interface;

pub const BUS_NAME: &str = "org.doorbell.Doorbell1";
pub const OBJECT_PATH: &str = "/org/doorbell/Doorbell1";

/// D-Bus admin interface for the doorbell daemon.
///
/// Bus name: org.doorbell.Doorbell1
/// Object path: /org/doorbell/Doorbell1
pub struct DoorbellService {
    engine: EngineHandle,
}

impl DoorbellService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "admin request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.doorbell.Doorbell1")]
impl DoorbellService {
    /// Unlock the door in answer to the ringing bell.
    ///
    /// Returns false when no one has rung.
    async fn force_unlock(&self) -> zbus::fdo::Result<bool> {
        tracing::info!(actor = %Actor::Admin, "force unlock requested");
        self.engine.force_unlock().await.map_err(to_fdo)
    }

    async fn silence_bell(&self) -> zbus::fdo::Result<bool> {
        tracing::info!(actor = %Actor::Admin, "silence requested");
        self.engine.silence_bell().await.map_err(to_fdo)
    }

    /// Lock the door, silence the bell and clear all timers.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        tracing::info!(actor = %Actor::Admin, "reset requested");
        self.engine.reset().await.map_err(to_fdo)
    }

    /// Re-read the known-face store. Returns the number of embeddings.
    async fn reload_faces(&self) -> zbus::fdo::Result<u32> {
        tracing::info!(actor = %Actor::Admin, "face reload requested");
        let count = self.engine.reload_faces().await.map_err(to_fdo)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Current door, bell and recognition state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "door": status.door,
            "bell": status.bell,
            "current_identity": status.current_identity,
            "open_too_long": status.open_too_long,
            "known_embeddings": status.known_embeddings,
            "known_users": status.known_users,
            "frames_processed": status.frames_processed,
        }))
    }

    /// Recent access events, oldest first, as a JSON array.
    async fn history(&self) -> zbus::fdo::Result<String> {
        to_json(&self.engine.history())
    }
}
