use anyhow::{Context, Result};
use doorbell_core::{FaceStore, Worker};
use doorbell_hw::{Camera, EdgeWatcher, GpioPanel};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod analyzer;
mod config;
mod dbus_interface;
mod engine;
mod sink;

use analyzer::ProcessAnalyzer;
use config::{BusKind, Config};
use dbus_interface::{DoorbellService, BUS_NAME, OBJECT_PATH};
use sink::SnapshotSink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("doorbelld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        source = ?config.source,
        camera = %config.camera_device,
        face_store = %config.face_store.display(),
        tolerance = config.match_tolerance,
        analyzer = ?config.analyzer_command,
        bus = ?config.dbus_bus,
        "configuration loaded"
    );

    let gpio_root = doorbell_hw::panel::sysfs_root();
    let panel = GpioPanel::open(&gpio_root, &config.pins).context("failed to open indicator pins")?;

    let mut camera = Camera::open(
        &config.camera_device,
        config.frame_width,
        config.frame_height(),
    )
    .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    camera.warm_up(config.warmup_frames);

    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker::new(
        panel,
        camera,
        ProcessAnalyzer::new(config.analyzer_command.clone(), config.analyzer_timeout()),
        SnapshotSink::new(config.snapshot_path.clone(), config.snapshot_interval()),
        FaceStore::new(config.face_store.clone()),
        rx,
        config.worker_config(),
    );
    let engine = engine::spawn_engine(worker, tx).context("failed to start engine")?;
    let handle = engine.handle();

    let edge_handle = handle.clone();
    let watcher = EdgeWatcher::spawn(&gpio_root, &config.pins, move |edge| {
        if edge_handle.send_edge(edge).is_err() {
            tracing::debug!(?edge, "engine stopped; edge dropped");
        }
    })
    .context("failed to watch input pins")?;

    let builder = match config.dbus_bus {
        BusKind::System => zbus::connection::Builder::system(),
        BusKind::Session => zbus::connection::Builder::session(),
    }
    .context("failed to connect to D-Bus")?;
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, DoorbellService::new(handle))?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME}"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "doorbelld ready");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for Ctrl-C")?,
        _ = sigterm.recv() => {}
    }
    tracing::info!("doorbelld shutting down");

    drop(connection);
    tokio::task::spawn_blocking(move || {
        watcher.stop();
        engine.shutdown();
    })
    .await
    .context("shutdown task failed")?;

    tracing::info!("doorbelld stopped");
    Ok(())
}
