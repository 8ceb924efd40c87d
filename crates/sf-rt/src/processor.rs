//! Multi-threaded MIMO (multiple input, multiple output) processor
//!
//! Owns the command queue, the query queue and the worker pool, and
//! schedules `RtList`s of processing items across the pool once per audio
//! period.  Renderers compose a `MimoProcessor` and drive their lists in
//! the order their algorithm requires.

use std::sync::Arc;

use sf_core::{ConfigError, Params};
use thiserror::Error;

use crate::{CommandQueue, RtList, WorkerPool};

/// Default number of processing threads (1 = audio thread only).
const DEFAULT_THREADS: usize = 1;
/// Default command-queue capacity.
const DEFAULT_FIFO_SIZE: usize = 128;

/// An item of the realtime processing graph.
///
/// Items within one list must be independent of each other; between lists
/// there is a happens-before barrier at the `process_list` boundary.
pub trait Processable: Send + Sync {
    fn process(&self);
}

/// Error from the host audio interface or the processor state machine.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Audio backend error: {0}")]
    Backend(String),

    #[error("Worker thread creation failed: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Seam for the host audio interface.
///
/// The engine itself only needs start/stop; the host calls
/// `audio_callback` on the renderer from its own realtime thread.  Real
/// backends (JACK, ALSA, ...) live in outer layers.
pub trait AudioBackend: Send {
    fn start(&mut self) -> Result<(), BackendError>;
    fn stop(&mut self) -> Result<(), BackendError>;
}

/// Backend that does nothing; used for tests and offline hosts that drive
/// `audio_callback` directly.
#[derive(Debug, Default)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn start(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Scheduling core shared by all renderers.
pub struct MimoProcessor {
    fifo: Arc<CommandQueue>,
    query_fifo: Arc<CommandQueue>,
    pool: WorkerPool,
    block_size: usize,
    sample_rate: u32,
    backend: Box<dyn AudioBackend>,
}

impl MimoProcessor {
    /// Build the processor from configuration.
    ///
    /// Recognized keys: `block_size` (positive multiple of 8, required),
    /// `sample_rate` (required), `threads` (default 1), `fifo_size`
    /// (default 128).  The command queue starts out deactivated so that
    /// non-realtime initialization can use it synchronously; `activate`
    /// flips it live.
    pub fn new(params: &Params, backend: Box<dyn AudioBackend>) -> Result<Self, ConfigError> {
        let block_size: usize = params.require("block_size")?;
        if block_size < 8 || block_size % 8 != 0 {
            return Err(ConfigError::InvalidBlockSize(block_size));
        }

        let sample_rate: u32 = params.require("sample_rate")?;
        let threads: usize = params.get_or("threads", DEFAULT_THREADS)?;
        let fifo_size: usize = params.get_or("fifo_size", DEFAULT_FIFO_SIZE)?;

        let pool = WorkerPool::new(threads).map_err(|e| ConfigError::Invalid {
            key: "threads".to_string(),
            value: format!("{threads}: {e}"),
        })?;

        let fifo = CommandQueue::new(fifo_size);
        let query_fifo = CommandQueue::new(fifo_size);

        // Deactivate for non-realtime initialization; the queue is empty,
        // so this cannot fail.
        fifo.deactivate();

        Ok(Self {
            fifo,
            query_fifo,
            pool,
            block_size,
            sample_rate,
            backend,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// The command queue connecting the control plane to the audio thread.
    pub fn fifo(&self) -> &Arc<CommandQueue> {
        &self.fifo
    }

    /// The queue carrying level/transport queries back to the control
    /// plane.
    pub fn query_fifo(&self) -> &Arc<CommandQueue> {
        &self.query_fifo
    }

    /// Re-enable the command queue and start the host audio interface.
    pub fn activate(&mut self) -> Result<(), BackendError> {
        self.fifo.reactivate();
        self.backend.start()
    }

    /// Stop the host audio interface, then drain the command queue from
    /// the non-realtime side until no new commands appear, and deactivate
    /// it.
    ///
    /// Panics if the queue cannot be deactivated afterwards; that means a
    /// command was pushed concurrently, which is a bug in the caller's
    /// threading discipline.
    pub fn deactivate(&mut self) -> Result<(), BackendError> {
        self.backend.stop()?;

        // No further audio callbacks from here on.  Item destructors push
        // commands of their own, hence the loop.
        loop {
            self.fifo.process_commands();
            self.fifo.cleanup_commands();
            if !self.fifo.commands_available() {
                break;
            }
        }
        assert!(
            self.fifo.deactivate(),
            "command queue not empty after deactivation"
        );
        Ok(())
    }

    /// Block the calling (non-realtime) thread until all previously pushed
    /// commands have been executed and cleaned up.
    pub fn wait_for_rt(&self) {
        self.fifo.wait();
    }

    /// Process one list with the worker pool.  Realtime thread only.
    pub fn process_list<T>(&self, list: &RtList<Arc<T>>)
    where
        T: Processable + 'static,
    {
        if list.is_empty() {
            return;
        }
        let stride = self.pool.threads();
        self.pool
            .process(&|thread| list.process_items(thread, stride, |item| item.process()));
    }

    /// Drain the inbound command queue.  Realtime thread only.
    pub fn process_commands(&self) {
        self.fifo.process_commands();
    }

    /// Drain the query queue.  Realtime thread only.
    pub fn process_queries(&self) {
        self.query_fifo.process_commands();
    }
}

// ------------ query plumbing ------------

/// A periodic snapshot carried through the query queue.
///
/// `fetch` runs on the realtime thread and must not allocate; `deliver`
/// runs on the non-realtime query thread.
pub trait Query: Send + 'static {
    fn fetch(&mut self);
    fn deliver(&mut self);
}

/// Handle controlling a re-arming query cycle.
pub struct QueryArm {
    armed: Arc<std::sync::atomic::AtomicBool>,
}

impl QueryArm {
    /// Start a query cycle: the query is fetched once per period and
    /// re-armed from its own cleanup until the handle is disarmed.
    pub fn start<Q: Query>(query_fifo: &Arc<CommandQueue>, query: Q) -> Self {
        let armed = Arc::new(std::sync::atomic::AtomicBool::new(true));
        query_fifo.push(Box::new(QueryCommand {
            query: Some(query),
            fifo: Arc::clone(query_fifo),
            armed: Arc::clone(&armed),
        }));
        Self { armed }
    }

    /// Stop re-arming; the in-flight command finishes its cycle.
    pub fn disarm(&self) {
        self.armed.store(false, std::sync::atomic::Ordering::Release);
    }
}

impl Drop for QueryArm {
    fn drop(&mut self) {
        self.disarm();
    }
}

struct QueryCommand<Q: Query> {
    query: Option<Q>,
    fifo: Arc<CommandQueue>,
    armed: Arc<std::sync::atomic::AtomicBool>,
}

impl<Q: Query> crate::Command for QueryCommand<Q> {
    fn execute(&mut self) {
        if let Some(query) = &mut self.query {
            query.fetch();
        }
    }

    fn cleanup(&mut self) {
        if let Some(mut query) = self.query.take() {
            query.deliver();
            if self.armed.load(std::sync::atomic::Ordering::Acquire) {
                // Re-arm for the next period.
                self.fifo.push(Box::new(QueryCommand {
                    query: Some(query),
                    fifo: Arc::clone(&self.fifo),
                    armed: Arc::clone(&self.armed),
                }));
            }
        }
    }
}
