use {
    crate::MAX_SEMAPHORE_VALUE as MAX_VALUE,
    std::sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Wait {
    Done,
    WouldBlock,
    Interrupted,
    Removed,
    Overflow,
}

#[derive(Debug, Default)]
struct Counter {
    value: u16,
    removed: bool,
}

/// Counting semaphore with the kernel's observable behaviour: a waiter can
/// be woken early by an interrupt, and removal fails every waiter.
#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    data: (Mutex<Counter>, Condvar),
}

impl Semaphore {
    fn lock(&self) -> MutexGuard<'_, Counter> {
        self.data.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subtracts `amount`, waiting while the counter is too small. The
    /// `interrupted` check runs under the counter lock before each wait.
    pub(crate) fn acquire<F>(&self, amount: u16, no_wait: bool, interrupted: F) -> Wait
    where
        F: Fn() -> bool,
    {
        let mut counter = self.lock();
        loop {
            if counter.removed {
                return Wait::Removed;
            }
            if counter.value >= amount {
                counter.value -= amount;
                return Wait::Done;
            }
            if no_wait {
                return Wait::WouldBlock;
            }
            if interrupted() {
                return Wait::Interrupted;
            }
            counter = self
                .data
                .1
                .wait(counter)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(crate) fn release(&self, amount: u16) -> Wait {
        let mut counter = self.lock();
        if counter.removed {
            return Wait::Removed;
        }
        match counter.value.checked_add(amount) {
            Some(value) if value <= MAX_VALUE => counter.value = value,
            _ => return Wait::Overflow,
        }
        if amount == 1 {
            self.data.1.notify_one();
        } else {
            self.data.1.notify_all();
        }
        Wait::Done
    }

    pub(crate) fn set(&self, value: u16) -> Wait {
        let mut counter = self.lock();
        if counter.removed {
            return Wait::Removed;
        }
        if value > MAX_VALUE {
            return Wait::Overflow;
        }
        counter.value = value;
        self.data.1.notify_all();
        Wait::Done
    }

    pub(crate) fn remove(&self) {
        self.lock().removed = true;
        self.data.1.notify_all();
    }

    /// Wakes every waiter so it re-checks its interrupt flag. Taking the lock
    /// orders this after any waiter that checked the flag but has not yet
    /// started waiting.
    pub(crate) fn wake_all(&self) {
        let _counter = self.lock();
        self.data.1.notify_all();
    }
}
