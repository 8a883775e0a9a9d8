use thiserror::Error;

#[macro_use]
extern crate bitflags;

mod backend;
mod process;
mod region;
mod semaphore;

#[cfg(feature = "threads")]
mod sync;

pub use backend::Adapter;
pub use process::*;
pub use region::*;
pub use semaphore::*;

#[cfg(feature = "sysv")]
pub use backend::sysv;

#[cfg(feature = "threads")]
pub use backend::threads;

#[cfg(feature = "sysv")]
pub fn sysv_context() -> Result<Context<backend::sysv::Backend>, Error> {
    backend::sysv::new_context()
}

#[cfg(feature = "threads")]
pub fn thread_context() -> Context<backend::threads::Backend> {
    backend::threads::new_context(backend::threads::Backend::new())
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kernel resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("synchronization failure: {0}")]
    Sync(String),

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("failed to allocate shared region: {0}")]
    AllocationFailed(String),

    #[error("{what} index {index} out of range (len {len})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub struct Context<A> {
    backend: A,
}

impl<A> Context<A>
where
    A: Adapter,
{
    pub fn adapter(&self) -> &A {
        &self.backend
    }

    /// Creates `size` semaphores under one kernel handle, all at zero.
    pub fn new_semaphore_set(&self, size: usize) -> Result<SemaphoreSet, Error> {
        if size == 0 || size > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "semaphore set size must be in 1..={}, got {}",
                u16::MAX,
                size
            )));
        }
        let handle = self.backend.new_semaphore_set(size as u16)?;
        let set = SemaphoreSet::new(handle, size as u16);
        set.set_all(&vec![0; size])?;
        Ok(set)
    }

    pub fn new_region(&self, byte_size: usize) -> Result<Region, Error> {
        if byte_size == 0 {
            return Err(Error::InvalidArgument("region size must be non-zero".into()));
        }
        let handle = self.backend.new_region(byte_size)?;
        Ok(Region::new(handle, byte_size))
    }

    /// Allocates `count` regions of `CHUNKS_PER_REGION` chunks each. Regions
    /// allocated before a failure are freed again.
    pub fn new_region_pool(&self, count: usize) -> Result<RegionPool, Error> {
        if count == 0 {
            return Err(Error::InvalidArgument("region pool must not be empty".into()));
        }
        let regions = (0..count)
            .map(|_| self.new_region(REGION_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RegionPool::new(regions))
    }

    pub fn spawn<T: Task>(&self, task: T) -> Result<WorkerHandle, SpawnError<T>> {
        self.backend.spawn(task)
    }

    pub fn wait(&self, worker: WorkerHandle) -> Result<ExitStatus, Error> {
        self.backend.wait(worker)
    }

    /// Reaps `worker` if it has exited, otherwise hands it back.
    pub fn try_wait(&self, worker: WorkerHandle) -> Result<TryWait, Error> {
        self.backend.try_wait(worker)
    }

    pub fn interrupt(&self, worker: &WorkerHandle) -> Result<(), Error> {
        self.backend.interrupt(worker)
    }
}
