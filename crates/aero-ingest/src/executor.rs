use std::thread::JoinHandle;

use thiserror::Error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const REACTOR_THREAD_NAME: &str = "aero-reactor";

/// True when called from inside the reactor, where blocking on its
/// shutdown can never complete.
pub(crate) fn on_reactor_thread() -> bool {
    std::thread::current().name() == Some(REACTOR_THREAD_NAME)
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor already started")]
    AlreadyStarted,

    #[error("executor not running")]
    NotRunning,

    #[error("build reactor runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("spawn reactor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

struct Worker {
    handle: Handle,
    // Dropping or firing this lets the reactor thread leave block_on.
    keep_alive: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// Owns the single reactor thread that drives all socket I/O.
///
/// The reactor is a tokio current-thread runtime parked on a keep-alive
/// guard, so it keeps servicing spawned tasks while otherwise idle.
/// `stop()` releases the guard, drops the runtime (cancelling every task
/// still on it) and joins the thread.
pub struct AsyncExecutor {
    worker: Option<Worker>,
    started: bool,
}

impl AsyncExecutor {
    pub fn new() -> Self {
        Self { worker: None, started: false }
    }

    pub fn start(&mut self) -> Result<(), ExecutorError> {
        if self.started {
            return Err(ExecutorError::AlreadyStarted);
        }

        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ExecutorError::Runtime)?;
        let handle = runtime.handle().clone();
        let (keep_alive, guard) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(REACTOR_THREAD_NAME.into())
            .spawn(move || {
                debug!("executor: reactor running");
                // Err just means the sender was dropped; either way we stop.
                let _ = runtime.block_on(guard);
                drop(runtime);
                debug!("executor: reactor exited");
            })
            .map_err(ExecutorError::Spawn)?;

        self.worker = Some(Worker { handle, keep_alive, thread });
        self.started = true;
        info!("executor: started");
        Ok(())
    }

    /// Blocks until the reactor thread has exited. Must not be called
    /// from the reactor thread itself.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else { return; };
        let _ = worker.keep_alive.send(());
        if on_reactor_thread() {
            // Joining ourselves would deadlock; the thread exits once the
            // current task yields back to block_on.
            warn!("executor: stopped from the reactor thread, not waiting for it to exit");
            return;
        }
        if worker.thread.join().is_err() {
            warn!("executor: reactor thread panicked");
        }
        info!("executor: stopped");
    }

    /// Scheduling handle for binding sockets and spawning tasks on the
    /// reactor. Does not run anything by itself.
    pub fn handle(&self) -> Result<Handle, ExecutorError> {
        self.worker.as_ref().map(|w| w.handle.clone()).ok_or(ExecutorError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Default for AsyncExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
