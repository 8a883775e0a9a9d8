use crate::{
    process::{ExitStatus, SpawnError, Task, TryWait, WorkerHandle},
    region::RegionHandle,
    semaphore::SemaphoreSetHandle,
    Error,
};

#[cfg(feature = "sysv")]
pub mod sysv;

#[cfg(feature = "threads")]
pub mod threads;

/// Creation side of a backend. Operations on an existing semaphore set or
/// region dispatch on the handle itself, so that a worker holding only a
/// handle (possibly in another process) can use it without a `Context`.
pub trait Adapter {
    fn new_semaphore_set(&self, size: u16) -> Result<SemaphoreSetHandle, Error>;
    fn new_region(&self, byte_size: usize) -> Result<RegionHandle, Error>;

    fn spawn<T: Task>(&self, task: T) -> Result<WorkerHandle, SpawnError<T>>;
    fn wait(&self, worker: WorkerHandle) -> Result<ExitStatus, Error>;
    fn try_wait(&self, worker: WorkerHandle) -> Result<TryWait, Error>;
    fn interrupt(&self, worker: &WorkerHandle) -> Result<(), Error>;
}
