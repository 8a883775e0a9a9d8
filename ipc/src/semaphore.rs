#![allow(non_upper_case_globals)]

use {crate::Error, std::sync::Arc};

#[cfg(feature = "sysv")]
use crate::backend::sysv;

#[cfg(feature = "threads")]
use crate::backend::threads;

/// Largest value a semaphore may hold (the kernel's `SEMVMX`).
pub const MAX_SEMAPHORE_VALUE: u16 = i16::MAX as u16;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpFlags: u8 {
        const NoWait = 0x01;
    }
}

/// One semaphore operation: add `delta` to semaphore `num`, blocking while
/// the result would be negative unless `NoWait` is set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SemOp {
    pub num: u16,
    pub delta: i16,
    pub flags: OpFlags,
}

impl SemOp {
    fn p(num: u16) -> SemOp {
        SemOp {
            num,
            delta: -1,
            flags: OpFlags::empty(),
        }
    }

    fn v(num: u16) -> SemOp {
        SemOp {
            num,
            delta: 1,
            flags: OpFlags::empty(),
        }
    }
}

/// Outcome of a single backend operation. Interrupts and would-block never
/// leave this crate.
#[derive(Debug)]
pub(crate) enum OpError {
    Interrupted,
    WouldBlock,
    Failed(Error),
}

#[derive(Clone, Debug)]
pub enum SemaphoreSetHandle {
    #[cfg(feature = "sysv")]
    SysV { id: libc::c_int },

    #[cfg(feature = "threads")]
    Local(Arc<threads::LocalSet>),

    Unsupported,
}

impl SemaphoreSetHandle {
    fn apply(&self, op: &SemOp) -> Result<(), OpError> {
        match self {
            #[cfg(feature = "sysv")]
            SemaphoreSetHandle::SysV { id } => sysv::semaphore_op(*id, op),
            #[cfg(feature = "threads")]
            SemaphoreSetHandle::Local(set) => set.apply(op),
            SemaphoreSetHandle::Unsupported => Err(OpError::Failed(Error::Sync(
                "semaphore set has no backend".into(),
            ))),
        }
    }

    fn set_all(&self, values: &[u16]) -> Result<(), Error> {
        match self {
            #[cfg(feature = "sysv")]
            SemaphoreSetHandle::SysV { id } => sysv::set_all(*id, values),
            #[cfg(feature = "threads")]
            SemaphoreSetHandle::Local(set) => set.set_all(values),
            SemaphoreSetHandle::Unsupported => {
                Err(Error::Sync("semaphore set has no backend".into()))
            }
        }
    }

    fn remove(&self) -> Result<(), Error> {
        match self {
            #[cfg(feature = "sysv")]
            SemaphoreSetHandle::SysV { id } => sysv::remove_semaphore_set(*id),
            #[cfg(feature = "threads")]
            SemaphoreSetHandle::Local(set) => set.remove(),
            SemaphoreSetHandle::Unsupported => Ok(()),
        }
    }
}

/// Owner of a semaphore set. There is exactly one per kernel set, and only
/// the owner can destroy it; dropping an owner that was never destroyed
/// destroys the set.
#[derive(Debug)]
pub struct SemaphoreSet {
    view: Semaphores,
    destroyed: bool,
}

impl SemaphoreSet {
    pub(crate) fn new(handle: SemaphoreSetHandle, size: u16) -> SemaphoreSet {
        SemaphoreSet {
            view: Semaphores {
                handle,
                p_ops: (0..size).map(SemOp::p).collect(),
                v_ops: (0..size).map(SemOp::v).collect(),
            },
            destroyed: false,
        }
    }

    pub fn size(&self) -> usize {
        self.view.size()
    }

    /// Sets every counter at once. Meant for priming before any worker can
    /// observe the set.
    pub fn set_all(&self, values: &[u16]) -> Result<(), Error> {
        if values.len() != self.size() {
            return Err(Error::InvalidArgument(format!(
                "expected {} initial values, got {}",
                self.size(),
                values.len()
            )));
        }
        self.view.handle.set_all(values)
    }

    /// A shareable view that can acquire and release but never destroy.
    pub fn handle(&self) -> Semaphores {
        self.view.clone()
    }

    pub fn destroy(mut self) -> Result<(), Error> {
        self.destroyed = true;
        log::debug!("destroying semaphore set of {}", self.size());
        self.view.handle.remove()
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        log::warn!("semaphore set dropped without explicit teardown, removing it");
        if let Err(e) = self.view.handle.remove() {
            log::error!("failed to remove semaphore set: {}", e);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Semaphores {
    handle: SemaphoreSetHandle,
    p_ops: Arc<[SemOp]>,
    v_ops: Arc<[SemOp]>,
}

impl Semaphores {
    pub fn size(&self) -> usize {
        self.p_ops.len()
    }

    /// P: decrements semaphore `index`, blocking until that is possible.
    /// Interrupted waits are resumed, never reported.
    pub fn acquire(&self, index: usize) -> Result<(), Error> {
        let op = *self.op(&self.p_ops, index)?;
        self.apply(&op)
    }

    /// V: increments semaphore `index`, waking one blocked acquirer.
    pub fn release(&self, index: usize) -> Result<(), Error> {
        let op = *self.op(&self.v_ops, index)?;
        self.apply(&op)
    }

    /// P without blocking. Returns `false` if the semaphore is at zero.
    pub fn try_acquire(&self, index: usize) -> Result<bool, Error> {
        let op = SemOp {
            flags: OpFlags::NoWait,
            ..*self.op(&self.p_ops, index)?
        };
        loop {
            match self.handle.apply(&op) {
                Ok(()) => return Ok(true),
                Err(OpError::WouldBlock) => return Ok(false),
                Err(OpError::Interrupted) => continue,
                Err(OpError::Failed(e)) => return Err(e),
            }
        }
    }

    /// Acquires `wait` and returns a permit that releases `signal` when it
    /// is left or dropped. Both indices are checked before blocking.
    pub fn enter(&self, wait: usize, signal: usize) -> Result<Permit<'_>, Error> {
        self.op(&self.v_ops, signal)?;
        self.acquire(wait)?;
        Ok(Permit {
            semaphores: self,
            signal,
            released: false,
        })
    }

    fn op<'a>(&self, ops: &'a [SemOp], index: usize) -> Result<&'a SemOp, Error> {
        ops.get(index).ok_or(Error::OutOfRange {
            what: "semaphore",
            index,
            len: ops.len(),
        })
    }

    fn apply(&self, op: &SemOp) -> Result<(), Error> {
        loop {
            match self.handle.apply(op) {
                Ok(()) => return Ok(()),
                Err(OpError::Interrupted) => {
                    log::trace!("semaphore {} op interrupted, retrying", op.num);
                }
                Err(OpError::WouldBlock) => {
                    return Err(Error::Sync(format!(
                        "blocking operation on semaphore {} reported would-block",
                        op.num
                    )))
                }
                Err(OpError::Failed(e)) => return Err(e),
            }
        }
    }
}

/// Proof of being inside a critical section. The signal semaphore is
/// released exactly once, by `leave` or on drop.
#[must_use]
pub struct Permit<'a> {
    semaphores: &'a Semaphores,
    signal: usize,
    released: bool,
}

impl Permit<'_> {
    pub fn signal(&self) -> usize {
        self.signal
    }

    pub fn leave(mut self) -> Result<(), Error> {
        self.released = true;
        self.semaphores.release(self.signal)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.semaphores.release(self.signal) {
            log::error!("failed to release semaphore {}: {}", self.signal, e);
        }
    }
}

#[cfg(all(test, feature = "threads"))]
mod tests {
    use {
        super::*,
        crate::thread_context,
        std::{thread, time::Duration},
    };

    #[test]
    fn new_set_starts_at_zero() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(3).unwrap();
        let sems = set.handle();
        for i in 0..3 {
            assert!(!sems.try_acquire(i).unwrap());
        }
        set.destroy().unwrap();
    }

    #[test]
    fn zero_sized_set_is_rejected() {
        let ctx = thread_context();
        assert!(matches!(
            ctx.new_semaphore_set(0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn release_then_acquire() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(2).unwrap();
        let sems = set.handle();
        sems.release(1).unwrap();
        sems.release(1).unwrap();
        sems.acquire(1).unwrap();
        assert!(sems.try_acquire(1).unwrap());
        assert!(!sems.try_acquire(1).unwrap());
        assert!(!sems.try_acquire(0).unwrap());
        set.destroy().unwrap();
    }

    #[test]
    fn set_all_primes_each_counter() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(3).unwrap();
        set.set_all(&[2, 0, 1]).unwrap();
        let sems = set.handle();
        assert!(sems.try_acquire(0).unwrap());
        assert!(sems.try_acquire(0).unwrap());
        assert!(!sems.try_acquire(0).unwrap());
        assert!(!sems.try_acquire(1).unwrap());
        assert!(sems.try_acquire(2).unwrap());
        assert!(matches!(
            set.set_all(&[1, 1]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(set.set_all(&[MAX_SEMAPHORE_VALUE, 0, 0]).is_ok());
        assert!(set.set_all(&[MAX_SEMAPHORE_VALUE + 1, 0, 0]).is_err());
        set.destroy().unwrap();
    }

    #[test]
    fn out_of_range_index_fails_fast() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(2).unwrap();
        let sems = set.handle();
        assert!(matches!(
            sems.acquire(2),
            Err(Error::OutOfRange { index: 2, len: 2, .. })
        ));
        assert!(matches!(sems.release(7), Err(Error::OutOfRange { .. })));
        // The signal index is checked before blocking on the wait index.
        assert!(matches!(sems.enter(0, 2), Err(Error::OutOfRange { .. })));
        set.destroy().unwrap();
    }

    #[test]
    fn permit_releases_signal_on_drop() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(2).unwrap();
        set.set_all(&[1, 0]).unwrap();
        let sems = set.handle();
        {
            let permit = sems.enter(0, 1).unwrap();
            assert_eq!(permit.signal(), 1);
        }
        assert!(!sems.try_acquire(0).unwrap());
        assert!(sems.try_acquire(1).unwrap());

        sems.release(0).unwrap();
        sems.enter(0, 0).unwrap().leave().unwrap();
        assert!(sems.try_acquire(0).unwrap());
        set.destroy().unwrap();
    }

    #[test]
    fn release_wakes_blocked_acquire() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(1).unwrap();
        let sems = set.handle();
        let waiter = {
            let sems = sems.clone();
            thread::spawn(move || sems.acquire(0))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        sems.release(0).unwrap();
        waiter.join().unwrap().unwrap();
        set.destroy().unwrap();
    }

    #[test]
    fn destroy_fails_blocked_acquire() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(1).unwrap();
        let sems = set.handle();
        let waiter = {
            let sems = sems.clone();
            thread::spawn(move || sems.acquire(0))
        };
        thread::sleep(Duration::from_millis(50));
        set.destroy().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Sync(_))));
        assert!(matches!(sems.release(0), Err(Error::Sync(_))));
    }

    #[test]
    fn dropping_the_owner_removes_the_set() {
        let ctx = thread_context();
        let set = ctx.new_semaphore_set(1).unwrap();
        let sems = set.handle();
        drop(set);
        assert!(matches!(sems.try_acquire(0), Err(Error::Sync(_))));
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
    }
}
