use doorbell_core::{
    AccessEvent, Command, DoorbellStatus, EdgeEvent, FaceAnalyzer, FrameSource, Indicators,
    Input, PresentationSink, StoreError, Worker,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face store error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<DoorbellStatus>,
    history: watch::Receiver<VecDeque<AccessEvent>>,
}

impl EngineHandle {
    /// Enqueue a sensor edge. Never blocks; callable from any thread.
    pub fn send_edge(&self, edge: EdgeEvent) -> Result<(), EngineError> {
        self.tx
            .send(Input::Edge(edge))
            .map_err(|_| EngineError::ChannelClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Input::Command(make(reply_tx)))
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Unlock as the admin. Returns `false` when the bell is not ringing.
    pub async fn force_unlock(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::ForceUnlock { reply }).await
    }

    /// Returns `false` when the bell was already idle.
    pub async fn silence_bell(&self) -> Result<bool, EngineError> {
        self.request(|reply| Command::SilenceBell { reply }).await
    }

    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Re-read the known-face store now. Returns the number of embeddings.
    pub async fn reload_faces(&self) -> Result<usize, EngineError> {
        Ok(self.request(|reply| Command::ReloadFaces { reply }).await??)
    }

    pub fn status(&self) -> DoorbellStatus {
        self.status.borrow().clone()
    }

    /// Most recent access events, oldest first.
    pub fn history(&self) -> Vec<AccessEvent> {
        self.history.borrow().iter().cloned().collect()
    }
}

/// The running engine thread.
pub struct Engine {
    handle: EngineHandle,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait for it to lock the door and release the
    /// camera.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("engine thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Move the worker onto a dedicated OS thread and run it until
/// [`Engine::shutdown`].
///
/// The worker blocks on frame capture, so it never runs on the async
/// runtime. `tx` must be the sending half of the worker's input queue.
pub fn spawn_engine<S, A, P, K>(
    mut worker: Worker<S, A, P, K>,
    tx: mpsc::UnboundedSender<Input>,
) -> Result<Engine, EngineError>
where
    S: FrameSource + Send + 'static,
    A: FaceAnalyzer + Send + 'static,
    P: Indicators + Send + 'static,
    K: PresentationSink + Send + 'static,
{
    let handle = EngineHandle {
        tx,
        status: worker.subscribe_status(),
        history: worker.subscribe_history(),
    };
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("doorbell-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            worker.run(&thread_stop);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(Engine {
        handle,
        stop,
        thread: Some(thread),
    })
}
