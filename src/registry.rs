/// Shared registry of running worker handles.
///
/// Launch units append concurrently while the fleet starts; once the
/// launcher seals it, the membership is fixed and the supervisor only ever
/// sees an owned snapshot in command order.
///
/// Handles never signal a pid themselves. Requests go to the launch unit
/// that owns the child, which delivers them only while the process is
/// still unreaped, so a recycled pid is never hit.
use crate::terminate::Delivery;
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

/// A signal to deliver to one worker, with the delivery result sent back.
#[derive(Debug)]
pub struct SignalRequest {
    pub signal: Signal,
    pub reply: oneshot::Sender<nix::Result<Delivery>>,
}

/// The supervisor's record of one running worker.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    index: usize,
    name: String,
    pid: u32,
    exited: Arc<AtomicBool>,
    control: mpsc::UnboundedSender<SignalRequest>,
}

impl ProcessHandle {
    /// Create a handle for a freshly started process.
    ///
    /// `exited` is shared with the launch unit that waits on the process,
    /// and `control` feeds that unit's signal requests.
    pub fn new(
        index: usize,
        name: impl Into<String>,
        pid: u32,
        exited: Arc<AtomicBool>,
        control: mpsc::UnboundedSender<SignalRequest>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            pid,
            exited,
            control,
        }
    }

    /// Position of the originating command in the configured list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True once the owning launch unit has reaped the process.
    ///
    /// After this, `pid` may belong to an unrelated process and must not be
    /// signalled.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// False once the process was reaped or its launch unit is gone.
    pub fn is_live(&self) -> bool {
        !self.has_exited() && !self.control.is_closed()
    }

    /// Ask the owning launch unit to deliver `signal`.
    ///
    /// Resolves to `Delivery::Gone` when the unit has already reaped the
    /// process or no longer exists.
    pub async fn signal(&self, signal: Signal) -> nix::Result<Delivery> {
        if self.has_exited() {
            return Ok(Delivery::Gone);
        }
        let (reply, delivered) = oneshot::channel();
        if self.control.send(SignalRequest { signal, reply }).is_err() {
            return Ok(Delivery::Gone);
        }
        delivered.await.unwrap_or(Ok(Delivery::Gone))
    }
}

/// Why an append was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRejected {
    /// A handle for this command index is already registered.
    Duplicate { index: usize },
    /// The launch phase is over.
    Sealed,
}

impl std::fmt::Display for AppendRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppendRejected::Duplicate { index } => {
                write!(f, "a handle for command #{index} is already registered")
            }
            AppendRejected::Sealed => write!(f, "registry is sealed"),
        }
    }
}

impl std::error::Error for AppendRejected {}

#[derive(Debug, Default)]
struct Inner {
    handles: Vec<ProcessHandle>,
    sealed: bool,
}

/// Append-only collection of handles, guarded by a mutex.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    inner: Mutex<Inner>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking launch unit must not take the registry down with it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handle. Atomic with respect to other appends.
    pub fn append(&self, handle: ProcessHandle) -> Result<(), AppendRejected> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(AppendRejected::Sealed);
        }
        if inner.handles.iter().any(|h| h.index == handle.index) {
            return Err(AppendRejected::Duplicate {
                index: handle.index,
            });
        }
        inner.handles.push(handle);
        Ok(())
    }

    /// End the launch phase. Later appends are rejected.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    #[cfg(test)]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the handles, ordered by command index.
    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut handles = self.lock().handles.clone();
        handles.sort_by_key(|h| h.index);
        handles
    }
}
