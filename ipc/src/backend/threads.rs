use crate::{
    backend::Adapter,
    process::{ExitStatus, SpawnError, Task, TryWait, WorkerHandle, PANIC_EXIT_CODE},
    region::RegionHandle,
    semaphore::{OpError, SemOp, SemaphoreSetHandle},
    sync::{Semaphore, Wait},
    Context, Error,
};
use std::{
    cell::{RefCell, UnsafeCell},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread,
};

pub fn new_context(backend: Backend) -> Context<Backend> {
    Context { backend }
}

thread_local! {
    static INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = RefCell::new(None);
}

/// Consumes a pending interrupt for the calling worker thread, if any.
fn take_interrupt() -> bool {
    INTERRUPT.with(|flag| {
        flag.borrow()
            .as_ref()
            .map_or(false, |flag| flag.swap(false, Ordering::AcqRel))
    })
}

#[derive(Debug, Default)]
struct Stats {
    semaphore_sets_removed: AtomicUsize,
    regions_freed: AtomicUsize,
}

/// In-process backend: workers are threads, regions are heap buffers and
/// semaphores are `Mutex`/`Condvar` counters.
pub struct Backend {
    sets: Mutex<Vec<Weak<LocalSet>>>,
    stats: Arc<Stats>,
    spawned: AtomicUsize,
    spawn_limit: Option<usize>,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::new()
    }
}

impl Backend {
    pub fn new() -> Backend {
        Backend {
            sets: Mutex::new(Vec::new()),
            stats: Arc::new(Stats::default()),
            spawned: AtomicUsize::new(0),
            spawn_limit: None,
        }
    }

    /// A backend whose spawns fail once `limit` workers have been started.
    pub fn with_spawn_limit(limit: usize) -> Backend {
        Backend {
            spawn_limit: Some(limit),
            ..Backend::new()
        }
    }

    pub fn semaphore_sets_removed(&self) -> usize {
        self.stats.semaphore_sets_removed.load(Ordering::SeqCst)
    }

    pub fn regions_freed(&self) -> usize {
        self.stats.regions_freed.load(Ordering::SeqCst)
    }

    fn wake_waiters(&self) {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        sets.retain(|set| match set.upgrade() {
            Some(set) => {
                set.semaphores.iter().for_each(Semaphore::wake_all);
                true
            }
            None => false,
        });
    }
}

impl Adapter for Backend {
    fn new_semaphore_set(&self, size: u16) -> Result<SemaphoreSetHandle, Error> {
        let set = Arc::new(LocalSet {
            semaphores: (0..size).map(|_| Semaphore::default()).collect(),
            removed: AtomicBool::new(false),
            stats: self.stats.clone(),
        });
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&set));
        Ok(SemaphoreSetHandle::Local(set))
    }

    fn new_region(&self, byte_size: usize) -> Result<RegionHandle, Error> {
        let words = (byte_size + 7) / 8;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(words)
            .map_err(|e| Error::AllocationFailed(format!("{} bytes: {}", byte_size, e)))?;
        storage.extend((0..words).map(|_| UnsafeCell::new(0u64)));
        Ok(RegionHandle::Local(Arc::new(LocalRegion {
            words: storage.into_boxed_slice(),
            freed: AtomicBool::new(false),
            stats: self.stats.clone(),
        })))
    }

    fn spawn<T: Task>(&self, task: T) -> Result<WorkerHandle, SpawnError<T>> {
        let id = self.spawned.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.spawn_limit {
            if id >= limit {
                return Err(SpawnError {
                    task,
                    source: Error::SpawnFailed(format!("spawn limit of {} reached", limit)),
                });
            }
        }

        // The thread takes the task out of the slot; if the thread never
        // starts, it is still there to hand back.
        let slot = Arc::new(Mutex::new(Some(task)));
        let interrupt = Arc::new(AtomicBool::new(false));
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn({
                let slot = slot.clone();
                let interrupt = interrupt.clone();
                move || {
                    INTERRUPT.with(|flag| *flag.borrow_mut() = Some(interrupt));
                    let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    match task {
                        Some(task) => panic::catch_unwind(AssertUnwindSafe(move || task.run()))
                            .unwrap_or(PANIC_EXIT_CODE),
                        None => PANIC_EXIT_CODE,
                    }
                }
            });
        match spawned {
            Ok(join) => Ok(WorkerHandle::Thread {
                id,
                join,
                interrupt,
            }),
            Err(e) => {
                let task = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                match task {
                    Some(task) => Err(SpawnError {
                        task,
                        source: Error::SpawnFailed(e.to_string()),
                    }),
                    None => unreachable!("worker thread failed to start but took its task"),
                }
            }
        }
    }

    fn wait(&self, worker: WorkerHandle) -> Result<ExitStatus, Error> {
        match worker {
            WorkerHandle::Thread { join, .. } => Ok(ExitStatus::Exited(
                join.join().unwrap_or(PANIC_EXIT_CODE),
            )),
            other => Err(Error::InvalidArgument(format!(
                "expected a thread worker, got {:?}",
                other
            ))),
        }
    }

    fn try_wait(&self, worker: WorkerHandle) -> Result<TryWait, Error> {
        if let WorkerHandle::Thread { join, .. } = &worker {
            if !join.is_finished() {
                return Ok(TryWait::Running(worker));
            }
        }
        self.wait(worker).map(TryWait::Exited)
    }

    fn interrupt(&self, worker: &WorkerHandle) -> Result<(), Error> {
        match worker {
            WorkerHandle::Thread { interrupt, .. } => {
                interrupt.store(true, Ordering::SeqCst);
                self.wake_waiters();
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!(
                "expected a thread worker, got {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub struct LocalSet {
    semaphores: Box<[Semaphore]>,
    removed: AtomicBool,
    stats: Arc<Stats>,
}

impl LocalSet {
    pub(crate) fn apply(&self, op: &SemOp) -> Result<(), OpError> {
        let semaphore = self.semaphores.get(op.num as usize).ok_or_else(|| {
            OpError::Failed(Error::OutOfRange {
                what: "semaphore",
                index: op.num as usize,
                len: self.semaphores.len(),
            })
        })?;
        let wait = if op.delta < 0 {
            semaphore.acquire(
                op.delta.unsigned_abs(),
                op.flags.contains(crate::OpFlags::NoWait),
                take_interrupt,
            )
        } else if op.delta > 0 {
            semaphore.release(op.delta as u16)
        } else {
            return Err(OpError::Failed(Error::InvalidArgument(
                "zero-valued semaphore operations are not supported".into(),
            )));
        };
        match wait {
            Wait::Done => Ok(()),
            Wait::WouldBlock => Err(OpError::WouldBlock),
            Wait::Interrupted => Err(OpError::Interrupted),
            Wait::Removed => Err(OpError::Failed(Error::Sync(format!(
                "semaphore {}: set has been removed",
                op.num
            )))),
            Wait::Overflow => Err(OpError::Failed(Error::Sync(format!(
                "semaphore {}: value would exceed {}",
                op.num,
                crate::MAX_SEMAPHORE_VALUE
            )))),
        }
    }

    pub(crate) fn set_all(&self, values: &[u16]) -> Result<(), Error> {
        for (num, (semaphore, value)) in self.semaphores.iter().zip(values).enumerate() {
            match semaphore.set(*value) {
                Wait::Done => {}
                Wait::Removed => return Err(Error::Sync("semaphore set has been removed".into())),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "semaphore {}: initial value {} is too large",
                        num, value
                    )))
                }
            }
        }
        Ok(())
    }

    pub(crate) fn remove(&self) -> Result<(), Error> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Err(Error::Sync("semaphore set has already been removed".into()));
        }
        self.semaphores.iter().for_each(Semaphore::remove);
        self.stats
            .semaphore_sets_removed
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Heap-backed region. Stored as words so that the base address is 8-byte
/// aligned like a kernel mapping.
pub struct LocalRegion {
    words: Box<[UnsafeCell<u64>]>,
    freed: AtomicBool,
    stats: Arc<Stats>,
}

// Concurrent access to the bytes is coordinated by the caller's semaphores.
unsafe impl Sync for LocalRegion {}

impl std::fmt::Debug for LocalRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegion")
            .field("len", &(self.words.len() * 8))
            .field("freed", &self.freed)
            .finish()
    }
}

impl LocalRegion {
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()) as *mut u8
    }

    pub(crate) fn free(&self) -> Result<(), Error> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Err(Error::AllocationFailed("region has already been freed".into()));
        }
        self.stats.regions_freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::thread_context,
        std::{sync::mpsc, time::Duration},
    };

    struct Exit(i32);

    impl Task for Exit {
        fn run(self) -> i32 {
            self.0
        }
    }

    struct Panic;

    impl Task for Panic {
        fn run(self) -> i32 {
            panic!("worker panicked")
        }
    }

    #[test]
    fn exit_codes_are_reported() {
        let ctx = thread_context();
        let ok = ctx.spawn(Exit(0)).unwrap();
        let failed = ctx.spawn(Exit(12)).unwrap();
        let panicked = ctx.spawn(Panic).unwrap();
        assert_eq!(ctx.wait(ok).unwrap(), ExitStatus::Exited(0));
        assert_eq!(ctx.wait(failed).unwrap(), ExitStatus::Exited(12));
        assert_eq!(
            ctx.wait(panicked).unwrap(),
            ExitStatus::Exited(PANIC_EXIT_CODE)
        );
    }

    #[test]
    fn try_wait_polls_until_the_worker_exits() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(1).unwrap();
        let (started, running) = mpsc::channel();
        let mut worker = ctx
            .spawn(Acquire {
                semaphores: set.handle(),
                started,
            })
            .unwrap();
        running.recv().unwrap();
        worker = match ctx.try_wait(worker).unwrap() {
            TryWait::Running(worker) => worker,
            TryWait::Exited(status) => panic!("blocked worker exited with {}", status),
        };

        set.handle().release(0).unwrap();
        let status = loop {
            match ctx.try_wait(worker).unwrap() {
                TryWait::Running(still) => {
                    worker = still;
                    thread::sleep(Duration::from_millis(5));
                }
                TryWait::Exited(status) => break status,
            }
        };
        assert_eq!(status, ExitStatus::Exited(0));
        set.destroy().unwrap();
    }

    #[test]
    fn spawn_limit_hands_the_task_back() {
        let ctx = new_context(Backend::with_spawn_limit(1));
        let first = ctx.spawn(Exit(0)).unwrap();
        let rejected = ctx.spawn(Exit(3)).unwrap_err();
        let (task, source) = rejected.into_parts();
        assert_eq!(task.0, 3);
        assert!(matches!(source, Error::SpawnFailed(_)));
        assert!(ctx.wait(first).unwrap().success());
    }

    struct Acquire {
        semaphores: crate::Semaphores,
        started: mpsc::Sender<()>,
    }

    impl Task for Acquire {
        fn run(self) -> i32 {
            self.started.send(()).ok();
            match self.semaphores.acquire(0) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        }
    }

    #[test]
    fn interrupted_acquire_keeps_waiting() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(1).unwrap();
        let (started, running) = mpsc::channel();
        let worker = ctx
            .spawn(Acquire {
                semaphores: set.handle(),
                started,
            })
            .unwrap();
        running.recv().unwrap();
        thread::sleep(Duration::from_millis(50));

        ctx.interrupt(&worker).unwrap();
        thread::sleep(Duration::from_millis(50));
        match &worker {
            WorkerHandle::Thread { join, interrupt, .. } => {
                assert!(!join.is_finished());
                // The blocked waiter consumed the interrupt and went back to
                // waiting.
                assert!(!interrupt.load(Ordering::SeqCst));
            }
            other => panic!("unexpected worker {:?}", other),
        }

        set.handle().release(0).unwrap();
        assert_eq!(ctx.wait(worker).unwrap(), ExitStatus::Exited(0));
        set.destroy().unwrap();
    }

    #[test]
    fn removal_and_free_are_counted_once() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(4).unwrap();
        let pool = ctx.new_region_pool(2).unwrap();
        set.destroy().unwrap();
        pool.free().unwrap();
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
        assert_eq!(ctx.adapter().regions_freed(), 2);
    }
}
