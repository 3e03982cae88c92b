use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::store::TileStore;

#[derive(Debug, thiserror::Error)]
#[error("failed to spawn tile decode worker: {0}")]
pub struct WorkerSpawnError(#[from] std::io::Error);

/// The single background thread that turns queued tiles into pixels.
pub struct DecodeWorker {
    store: Arc<TileStore>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn start(store: Arc<TileStore>) -> Result<Self, WorkerSpawnError> {
        store.reset_worker_stop();
        let thread_store = Arc::clone(&store);
        let handle = thread::Builder::new()
            .name("tile-decode".to_owned())
            .spawn(move || run_decode_loop(&thread_store))?;
        debug!("tile decode worker started");
        Ok(Self {
            store,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the worker and waits for the in-flight decode to settle.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.store.request_worker_stop();
        if handle.join().is_err() {
            warn!("tile decode worker panicked");
        }
        debug!("tile decode worker stopped");
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_decode_loop(store: &TileStore) {
    while let Some(mut job) = store.next_decode_job() {
        let result = job.decode();
        store.finish_decode(job, result);
    }
}
