use {crate::Error, std::fmt};

/// Exit code reported for a worker whose task panicked.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Body of a worker. It runs exactly once, in a separate process for the
/// `sysv` backend or a separate thread for the `threads` backend, and its
/// return value becomes the worker's exit code.
pub trait Task: Send + 'static {
    fn run(self) -> i32;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Exited(code) => Some(*code),
            ExitStatus::Signaled(_) => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {}", code),
            ExitStatus::Signaled(signal) => write!(f, "killed by signal {}", signal),
        }
    }
}

#[derive(Debug)]
pub enum WorkerHandle {
    #[cfg(feature = "sysv")]
    Process { pid: libc::pid_t },

    #[cfg(feature = "threads")]
    Thread {
        id: usize,
        join: std::thread::JoinHandle<i32>,
        interrupt: std::sync::Arc<std::sync::atomic::AtomicBool>,
    },

    Unsupported,
}

impl WorkerHandle {
    /// Process id or thread ordinal, for reporting.
    pub fn id(&self) -> u64 {
        match self {
            #[cfg(feature = "sysv")]
            WorkerHandle::Process { pid } => *pid as u64,
            #[cfg(feature = "threads")]
            WorkerHandle::Thread { id, .. } => *id as u64,
            WorkerHandle::Unsupported => 0,
        }
    }
}

/// Result of polling a worker without blocking.
#[derive(Debug)]
pub enum TryWait {
    Exited(ExitStatus),
    /// Still running; the handle is given back for a later poll.
    Running(WorkerHandle),
}

/// A task the backend could not start, handed back to the caller together
/// with the cause so that anything it owns can be recovered.
pub struct SpawnError<T> {
    pub task: T,
    pub source: Error,
}

impl<T> SpawnError<T> {
    pub fn into_parts(self) -> (T, Error) {
        (self.task, self.source)
    }
}

impl<T> fmt::Debug for SpawnError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SpawnError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}
