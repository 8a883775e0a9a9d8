use {
    crate::journal::{self, Entry},
    ipc::{ChunkAddr, RegionPool, Regions, SemaphoreSet, Semaphores, Task},
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::fmt,
};

/// The part of a worker's life it was in when it failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    CriticalSection,
    Release,
    Teardown,
}

impl Stage {
    const ALL: [Stage; 4] = [
        Stage::Acquire,
        Stage::CriticalSection,
        Stage::Release,
        Stage::Teardown,
    ];

    pub fn exit_code(self) -> i32 {
        match self {
            Stage::Acquire => 10,
            Stage::CriticalSection => 11,
            Stage::Release => 12,
            Stage::Teardown => 13,
        }
    }

    pub fn from_exit_code(code: i32) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.exit_code() == code)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Acquire => "acquire",
            Stage::CriticalSection => "critical section",
            Stage::Release => "release",
            Stage::Teardown => "teardown",
        })
    }
}

#[derive(Debug)]
pub struct Failure {
    pub stage: Stage,
    pub source: ipc::Error,
}

impl Failure {
    fn at(stage: Stage) -> impl FnOnce(ipc::Error) -> Failure {
        move |source| Failure { stage, source }
    }
}

/// Spins on random draws until one falls below `threshold`. Only changes
/// timing.
#[derive(Copy, Clone, Debug)]
pub struct Slowdown {
    pub threshold: u32,
}

impl Default for Slowdown {
    fn default() -> Self {
        Slowdown { threshold: 5000 }
    }
}

impl Slowdown {
    pub fn spin(&self, rng: &mut impl Rng) -> u64 {
        let mut draws = 1;
        while rng.gen::<u32>() >= self.threshold {
            draws += 1;
        }
        draws
    }
}

/// Everything needed to destroy the run's shared resources. Exactly one
/// exists per run, held either by the coordinator or by one worker.
#[derive(Debug)]
pub struct Teardown {
    pub semaphores: SemaphoreSet,
    pub regions: RegionPool,
}

impl Teardown {
    /// Destroys the semaphore set and frees the pool, attempting both.
    pub fn run(self) -> Result<(), ipc::Error> {
        log::info!("tearing down semaphore set and {} regions", self.regions.len());
        let destroyed = self.semaphores.destroy();
        let freed = self.regions.free();
        destroyed.and(freed)
    }
}

/// What a worker does once its swaps are done.
#[derive(Debug)]
pub enum Completion {
    /// Just exit; the coordinator owns teardown.
    Exit,
    /// Release the `done` semaphore on every exit path.
    Notify { done: usize },
    /// Wait for `peers` releases of `done`, then tear down.
    Cleanup {
        done: usize,
        peers: usize,
        teardown: Teardown,
    },
}

#[derive(Debug)]
pub struct Worker {
    pub index: usize,
    pub semaphores: Semaphores,
    pub regions: Regions,
    pub swaps: u32,
    pub wait: usize,
    pub signal: usize,
    pub pair: (ChunkAddr, ChunkAddr),
    pub seed: u64,
    pub slowdown: Option<Slowdown>,
    pub journal: Option<journal::Writer>,
    pub completion: Completion,
}

struct Notify<'a> {
    semaphores: &'a Semaphores,
    done: usize,
}

impl Drop for Notify<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.semaphores.release(self.done) {
            log::error!("failed to signal completion on semaphore {}: {}", self.done, e);
        }
    }
}

impl Worker {
    pub fn is_cleanup_owner(&self) -> bool {
        matches!(self.completion, Completion::Cleanup { .. })
    }

    /// Takes back the teardown token from a worker that never ran.
    pub fn into_teardown(self) -> Option<Teardown> {
        match self.completion {
            Completion::Cleanup { teardown, .. } => Some(teardown),
            _ => None,
        }
    }

    fn execute(self) -> Result<(), Failure> {
        let Worker {
            index,
            semaphores,
            regions,
            swaps,
            wait,
            signal,
            pair,
            seed,
            slowdown,
            journal,
            completion,
        } = self;

        let (notify, cleanup) = match completion {
            Completion::Exit => (None, None),
            Completion::Notify { done } => (Some(done), None),
            Completion::Cleanup {
                done,
                peers,
                teardown,
            } => (None, Some((done, peers, teardown))),
        };
        let _notify = notify.map(|done| Notify {
            semaphores: &semaphores,
            done,
        });

        let mut rng = StdRng::seed_from_u64(seed);
        let mut swapped = Ok(());
        for iteration in 0..swaps {
            if let Some(slowdown) = &slowdown {
                slowdown.spin(&mut rng);
            }

            let permit = match semaphores.enter(wait, signal) {
                Ok(permit) => permit,
                Err(e) => {
                    swapped = swapped.and(Err(Failure::at(Stage::Acquire)(e)));
                    break;
                }
            };
            // After a failed swap the worker only passes the token on, so
            // ring peers are not left waiting for it.
            if swapped.is_ok() {
                let enter = journal.as_ref().map(|journal| journal.tick());
                let result = regions.swap(&permit, pair.0, pair.1);
                if let (Some(journal), Some(enter)) = (&journal, enter) {
                    journal.record(Entry {
                        worker: index as u32,
                        iteration,
                        enter,
                        exit: journal.tick(),
                    });
                }
                match result {
                    Ok(()) => log::debug!(
                        "worker {} swapped {} <-> {} ({}/{})",
                        index,
                        pair.0,
                        pair.1,
                        iteration + 1,
                        swaps
                    ),
                    Err(e) => {
                        log::warn!("worker {} stops swapping: {}", index, e);
                        swapped = Err(Failure::at(Stage::CriticalSection)(e));
                    }
                }
            }
            if let Err(e) = permit.leave() {
                swapped = swapped.and(Err(Failure::at(Stage::Release)(e)));
                break;
            }
        }

        let Some((done, peers, teardown)) = cleanup else {
            return swapped;
        };
        // Peers signal completion on every exit path, so this only blocks
        // until the last of them is done. A failed wait drops the token,
        // which still tears everything down.
        for _ in 0..peers {
            semaphores
                .acquire(done)
                .map_err(Failure::at(Stage::Teardown))?;
        }
        let torn_down = teardown.run().map_err(Failure::at(Stage::Teardown));
        swapped.and(torn_down)
    }
}

impl Task for Worker {
    fn run(self) -> i32 {
        let index = self.index;
        match self.execute() {
            Ok(()) => 0,
            Err(failure) => {
                log::error!(
                    "worker {} failed during {}: {}",
                    index,
                    failure.stage,
                    failure.source
                );
                failure.stage.exit_code()
            }
        }
    }
}
