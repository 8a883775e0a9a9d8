use crate::{
    backend::Adapter,
    process::{ExitStatus, SpawnError, Task, TryWait, WorkerHandle, PANIC_EXIT_CODE},
    region::{RegionHandle, SharedAddr},
    semaphore::{OpError, OpFlags, SemOp, SemaphoreSetHandle},
    Context, Error,
};
use libc::{c_int, c_short, c_void};
use std::{
    io, mem,
    panic::{self, AssertUnwindSafe},
    ptr,
};

/// Owner read/write, as the segments and sets are private to one run.
const PERMS: c_int = 0o600;

/// Signal used to interrupt a worker blocked in `semop`.
pub const INTERRUPT_SIGNAL: c_int = libc::SIGUSR1;

/// Installs the interrupt handler, which every forked worker inherits.
pub fn new_context() -> Result<Context<Backend>, Error> {
    install_interrupt_handler()?;
    Ok(Context {
        backend: Backend { _private: () },
    })
}

/// System V backend: `semget` semaphore sets, `shmget` segments and
/// `fork`ed workers.
pub struct Backend {
    _private: (),
}

extern "C" fn on_interrupt(_: c_int) {}

fn install_interrupt_handler() -> Result<(), Error> {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_interrupt as extern "C" fn(c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        // No SA_RESTART, so a blocked semop returns EINTR.
        action.sa_flags = 0;
        if libc::sigaction(INTERRUPT_SIGNAL, &action, ptr::null_mut()) != 0 {
            return Err(Error::Sync(format!(
                "failed to install interrupt handler: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn is_limit(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSPC) | Some(libc::ENOMEM)
    )
}

impl Adapter for Backend {
    fn new_semaphore_set(&self, size: u16) -> Result<SemaphoreSetHandle, Error> {
        let id = unsafe { libc::semget(libc::IPC_PRIVATE, size as c_int, libc::IPC_CREAT | PERMS) };
        if id == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                // EINVAL: more semaphores than SEMMSL allows in one set.
                Some(libc::EINVAL) => {
                    Error::ResourceExhausted(format!("semget({}): {}", size, err))
                }
                _ if is_limit(&err) => {
                    Error::ResourceExhausted(format!("semget({}): {}", size, err))
                }
                _ => Error::Sync(format!("semget({}): {}", size, err)),
            });
        }
        log::debug!("created semaphore set {} of {}", id, size);
        Ok(SemaphoreSetHandle::SysV { id })
    }

    fn new_region(&self, byte_size: usize) -> Result<RegionHandle, Error> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, byte_size, libc::IPC_CREAT | PERMS) };
        if id == -1 {
            let err = io::Error::last_os_error();
            return Err(if is_limit(&err) {
                Error::ResourceExhausted(format!("shmget({}): {}", byte_size, err))
            } else {
                Error::AllocationFailed(format!("shmget({}): {}", byte_size, err))
            });
        }
        let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if addr as isize == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            return Err(Error::AllocationFailed(format!("shmat({}): {}", id, err)));
        }
        log::debug!("attached segment {} ({} bytes) at {:p}", id, byte_size, addr);
        Ok(RegionHandle::SysV {
            id,
            addr: SharedAddr(addr as *mut u8),
        })
    }

    fn spawn<T: Task>(&self, task: T) -> Result<WorkerHandle, SpawnError<T>> {
        match unsafe { libc::fork() } {
            -1 => Err(SpawnError {
                task,
                source: Error::SpawnFailed(format!("fork: {}", io::Error::last_os_error())),
            }),
            0 => {
                let code = panic::catch_unwind(AssertUnwindSafe(move || task.run()))
                    .unwrap_or(PANIC_EXIT_CODE);
                unsafe { libc::_exit(code) }
            }
            pid => {
                // The task belongs to the child from here on.
                mem::forget(task);
                Ok(WorkerHandle::Process { pid })
            }
        }
    }

    fn wait(&self, worker: WorkerHandle) -> Result<ExitStatus, Error> {
        let pid = process_id(worker)?;
        match waitpid(pid, 0)? {
            Some(status) => Ok(status),
            None => Err(Error::Sync(format!("waitpid({}): no status reported", pid))),
        }
    }

    fn try_wait(&self, worker: WorkerHandle) -> Result<TryWait, Error> {
        let pid = process_id(worker)?;
        Ok(match waitpid(pid, libc::WNOHANG)? {
            Some(status) => TryWait::Exited(status),
            None => TryWait::Running(WorkerHandle::Process { pid }),
        })
    }

    fn interrupt(&self, worker: &WorkerHandle) -> Result<(), Error> {
        match worker {
            WorkerHandle::Process { pid } => {
                if unsafe { libc::kill(*pid, INTERRUPT_SIGNAL) } == -1 {
                    return Err(Error::Sync(format!(
                        "kill({}): {}",
                        pid,
                        io::Error::last_os_error()
                    )));
                }
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!(
                "expected a process worker, got {:?}",
                other
            ))),
        }
    }
}

fn process_id(worker: WorkerHandle) -> Result<libc::pid_t, Error> {
    match worker {
        WorkerHandle::Process { pid } => Ok(pid),
        other => Err(Error::InvalidArgument(format!(
            "expected a process worker, got {:?}",
            other
        ))),
    }
}

/// `None` when `WNOHANG` is set and the child is still running.
fn waitpid(pid: libc::pid_t, options: c_int) -> Result<Option<ExitStatus>, Error> {
    let mut status: c_int = 0;
    loop {
        match unsafe { libc::waitpid(pid, &mut status, options) } {
            0 => return Ok(None),
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(Error::Sync(format!("waitpid({}): {}", pid, err)));
                }
            }
            _ => break,
        }
    }
    if libc::WIFEXITED(status) {
        Ok(Some(ExitStatus::Exited(libc::WEXITSTATUS(status))))
    } else if libc::WIFSIGNALED(status) {
        Ok(Some(ExitStatus::Signaled(libc::WTERMSIG(status))))
    } else {
        Err(Error::Sync(format!(
            "waitpid({}): unexpected status {:#x}",
            pid, status
        )))
    }
}

fn sem_flags(flags: OpFlags) -> c_short {
    let mut sem_flg = 0;
    if flags.contains(OpFlags::NoWait) {
        sem_flg |= libc::IPC_NOWAIT;
    }
    sem_flg as c_short
}

pub(crate) fn semaphore_op(id: c_int, op: &SemOp) -> Result<(), OpError> {
    let mut buf = libc::sembuf {
        sem_num: op.num,
        sem_op: op.delta,
        sem_flg: sem_flags(op.flags),
    };
    if unsafe { libc::semop(id, &mut buf, 1) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINTR) => Err(OpError::Interrupted),
        Some(libc::EAGAIN) => Err(OpError::WouldBlock),
        _ => Err(OpError::Failed(Error::Sync(format!(
            "semop(set {}, semaphore {}, {:+}): {}",
            id, op.num, op.delta, err
        )))),
    }
}

pub(crate) fn set_all(id: c_int, values: &[u16]) -> Result<(), Error> {
    let mut values = values.to_vec();
    if unsafe { libc::semctl(id, 0, libc::SETALL, values.as_mut_ptr()) } == -1 {
        return Err(Error::Sync(format!(
            "semctl(set {}, SETALL): {}",
            id,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub(crate) fn remove_semaphore_set(id: c_int) -> Result<(), Error> {
    if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } == -1 {
        return Err(Error::Sync(format!(
            "semctl(set {}, IPC_RMID): {}",
            id,
            io::Error::last_os_error()
        )));
    }
    log::debug!("removed semaphore set {}", id);
    Ok(())
}

/// Detaches the segment from this process and marks it for removal. The
/// kernel releases it once every other worker has detached or exited.
pub(crate) fn free_region(id: c_int, addr: SharedAddr) -> Result<(), Error> {
    if unsafe { libc::shmdt(addr.0 as *const c_void) } == -1 {
        return Err(Error::AllocationFailed(format!(
            "shmdt({}): {}",
            id,
            io::Error::last_os_error()
        )));
    }
    if unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
        return Err(Error::AllocationFailed(format!(
            "shmctl({}, IPC_RMID): {}",
            id,
            io::Error::last_os_error()
        )));
    }
    log::debug!("freed segment {}", id);
    Ok(())
}
