//! Engine lifecycle: start, terminate, join.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopMsg};
use crate::factory::StreamFactory;

/// State shared between the engine, its factories and handles, and the
/// loop thread.
pub(crate) struct Shared {
    /// True while new streams are accepted. Starts take the read lock for
    /// the duration of their post; terminate takes the write lock, so every
    /// accepted start is in the inbox before the terminate request.
    accepting: RwLock<bool>,
    pub inbox: Sender<LoopMsg>,
    /// Cancellation token checked by the loop at every iteration.
    pub shutdown: AtomicBool,
    pub clock: Clock,
    next_stream_id: AtomicU64,
}

impl Shared {
    pub(crate) fn gate(&self) -> RwLockReadGuard<'_, bool> {
        self.accepting
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_mut(&self) -> RwLockWriteGuard<'_, bool> {
        self.accepting
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Post to the loop if the engine is accepting work.
    pub(crate) fn post(&self, msg: LoopMsg) -> Result<(), Error> {
        let accepting = self.gate();
        if !*accepting {
            return Err(Error::EngineNotRunning);
        }
        self.inbox.send(msg).map_err(|_| Error::EngineNotRunning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Idle,
    Running,
    Terminated,
    Joined,
}

/// A streaming HTTP client engine.
///
/// Owns one background thread running the event loop. Every stream handler
/// for this engine runs on that thread.
///
/// ```rust,no_run
/// use rivulet::{Engine, EngineConfig};
///
/// let mut engine = Engine::new(EngineConfig::default())?;
/// engine.start()?;
/// let factory = engine.new_stream_factory()?;
/// # let _ = factory;
/// engine.terminate()?;
/// engine.join()?;
/// # Ok::<(), rivulet::Error>(())
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    config: Option<EngineConfig>,
    inbox: Option<Receiver<LoopMsg>>,
    thread: Option<JoinHandle<()>>,
    state: EngineState,
}

impl Engine {
    /// Create an engine. The configuration is validated and consumed here.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            accepting: RwLock::new(false),
            inbox: tx,
            shutdown: AtomicBool::new(false),
            clock: Clock::new(),
            next_stream_id: AtomicU64::new(1),
        });
        Ok(Engine {
            shared,
            config: Some(config),
            inbox: Some(rx),
            thread: None,
            state: EngineState::Idle,
        })
    }

    /// Spawn the engine thread and wait until its loop is running.
    pub fn start(&mut self) -> Result<(), Error> {
        let (Some(config), Some(inbox)) = (self.config.take(), self.inbox.take()) else {
            return Err(Error::AlreadyStarted);
        };
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("rivulet-engine".to_string())
            .spawn(move || {
                let mut event_loop = EventLoop::new(config, shared, inbox);
                let _ = ready_tx.send(());
                event_loop.run();
            })?;

        if ready_rx.recv().is_err() {
            // The thread died before signalling readiness.
            self.state = EngineState::Joined;
            let _ = handle.join();
            return Err(Error::EngineThreadPanicked);
        }

        *self.shared.gate_mut() = true;
        self.thread = Some(handle);
        self.state = EngineState::Running;
        info!("engine started");
        Ok(())
    }

    /// A factory for new streams. Factories stop working once the engine is
    /// terminated.
    pub fn new_stream_factory(&self) -> Result<StreamFactory, Error> {
        if self.state != EngineState::Running {
            return Err(Error::EngineNotRunning);
        }
        Ok(StreamFactory::new(self.shared.clone()))
    }

    /// Stop accepting streams and ask the loop to shut down.
    ///
    /// Returns immediately. The loop cancels every stream still in flight,
    /// closes its connections and exits; [`join`](Self::join) waits for that.
    pub fn terminate(&mut self) -> Result<(), Error> {
        {
            let mut accepting = self.shared.gate_mut();
            if !*accepting {
                return Err(Error::EngineNotRunning);
            }
            *accepting = false;
            self.shared.shutdown.store(true, Ordering::Release);
            // The loop may already be gone if a handler panicked.
            let _ = self.shared.inbox.send(LoopMsg::Terminate);
        }
        self.state = EngineState::Terminated;
        debug!("engine terminate requested");
        Ok(())
    }

    /// Block until the engine thread has exited. Requires a prior
    /// [`terminate`](Self::terminate).
    pub fn join(&mut self) -> Result<(), Error> {
        if self.state != EngineState::Terminated {
            return Err(Error::NotTerminated);
        }
        self.state = EngineState::Joined;
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        handle.join().map_err(|_| Error::EngineThreadPanicked)?;
        info!("engine joined");
        Ok(())
    }

    /// Returns true between a successful `start` and `terminate`.
    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state == EngineState::Running
            && let Err(e) = self.terminate()
        {
            warn!("terminate on drop failed: {e}");
        }
        if self.state == EngineState::Terminated
            && let Err(e) = self.join()
        {
            warn!("join on drop failed: {e}");
        }
    }
}
