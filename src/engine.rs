use {
    crate::{
        config::{CleanupOwner, Config, Variant},
        journal::{self, Entry, Journal},
        worker::{Completion, Slowdown, Stage, Teardown, Worker},
    },
    anyhow::{Context, Result},
    instant::Instant,
    ipc::{Chunk, ChunkAddr, ExitStatus, RegionPool, TryWait, WorkerHandle, CHUNK_SIZE},
    rand::{rngs::StdRng, Rng, SeedableRng},
    std::{thread, time::Duration},
};

/// How often the coordinator polls workers that are still running.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Semaphore indices a worker waits on and signals.
pub fn assignment(variant: Variant, workers: usize, index: usize) -> (usize, usize) {
    match variant {
        Variant::Pool => (0, 0),
        Variant::Ring => (index, (index + 1) % workers),
    }
}

/// Initial counter values: the pool semaphore holds every permit, the ring
/// starts with the token at worker 0, and the completion semaphore is empty.
pub fn initial_values(config: &Config) -> Vec<u16> {
    let mut values = vec![0; config.semaphore_count()];
    values[0] = match config.variant {
        Variant::Pool => config.permits,
        Variant::Ring => 1,
    };
    values
}

fn completion_index(config: &Config) -> Option<usize> {
    match config.cleanup {
        CleanupOwner::Coordinator => None,
        CleanupOwner::LastWorker => Some(config.semaphore_count() - 1),
    }
}

fn random_chunk(rng: &mut impl Rng, regions: usize) -> ChunkAddr {
    ChunkAddr::new(
        rng.gen_range(0..regions),
        Chunk::ALL[rng.gen_range(0..Chunk::ALL.len())],
    )
}

/// Region 0 gets lowercase letters, every other region uppercase.
fn seed_pool(pool: &mut RegionPool, rng: &mut impl Rng) -> Result<()> {
    for addr in pool.addresses().collect::<Vec<_>>() {
        let range = if addr.region == 0 { b'a'..=b'z' } else { b'A'..=b'Z' };
        let mut data = [0u8; CHUNK_SIZE];
        data.iter_mut().for_each(|byte| *byte = rng.gen_range(range.clone()));
        pool.write_chunk(addr, &data)?;
    }
    Ok(())
}

fn histogram(pool: &RegionPool) -> Result<[u64; 256]> {
    let mut counts = [0u64; 256];
    for addr in pool.addresses() {
        for byte in pool.read_chunk(addr)? {
            counts[byte as usize] += 1;
        }
    }
    Ok(counts)
}

#[derive(Debug)]
pub struct Outcome {
    pub index: usize,
    pub id: u64,
    pub status: Result<ExitStatus, String>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match &self.status {
            Ok(status) => status.code().and_then(Stage::from_exit_code),
            Err(_) => None,
        }
    }

    /// Whether the worker may have exited while holding, or still owing, a
    /// ring token. A failed swap does not count: the worker keeps passing
    /// the token until its iterations are done.
    pub fn strands_token(&self) -> bool {
        !self.success() && self.failed_stage() != Some(Stage::CriticalSection)
    }
}

/// Awaits every worker, polling so that `on_exit` sees each one as soon as
/// it finishes rather than in spawn order. Outcomes are sorted by index.
fn reap<A, F>(ctx: &ipc::Context<A>, mut pending: Vec<(usize, WorkerHandle)>, mut on_exit: F) -> Vec<Outcome>
where
    A: ipc::Adapter,
    F: FnMut(&Outcome),
{
    let mut outcomes = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let mut running = Vec::with_capacity(pending.len());
        for (index, handle) in pending {
            let id = handle.id();
            let status = match ctx.try_wait(handle) {
                Ok(TryWait::Running(handle)) => {
                    running.push((index, handle));
                    continue;
                }
                Ok(TryWait::Exited(status)) => Ok(status),
                Err(e) => Err(e.to_string()),
            };
            let outcome = Outcome { index, id, status };
            on_exit(&outcome);
            outcomes.push(outcome);
        }
        pending = running;
        if !pending.is_empty() {
            thread::sleep(REAP_INTERVAL);
        }
    }
    outcomes.sort_by_key(|outcome| outcome.index);
    outcomes
}

#[derive(Debug)]
pub struct Report {
    pub workers: Vec<Outcome>,
    pub spawn_failures: Vec<usize>,
    pub aborted: bool,
    /// Whether the pool's bytes are a permutation of the seeded bytes.
    /// Unknown when a worker freed the pool.
    pub conserved: Option<bool>,
    pub journal: Option<Vec<Entry>>,
    pub elapsed: Duration,
}

impl Report {
    pub fn success(&self) -> bool {
        !self.aborted
            && self.spawn_failures.is_empty()
            && self.conserved != Some(false)
            && self.workers.iter().all(Outcome::success)
    }

    pub fn log(&self) {
        for outcome in &self.workers {
            match (&outcome.status, outcome.failed_stage()) {
                (Ok(status), _) if status.success() => {
                    log::info!("worker {} [{}]: done", outcome.index, outcome.id)
                }
                (Ok(status), Some(stage)) => log::error!(
                    "worker {} [{}]: failed during {} ({})",
                    outcome.index,
                    outcome.id,
                    stage,
                    status
                ),
                (Ok(status), None) => {
                    log::error!("worker {} [{}]: {}", outcome.index, outcome.id, status)
                }
                (Err(e), _) => {
                    log::error!("worker {} [{}]: could not be awaited: {}", outcome.index, outcome.id, e)
                }
            }
        }
        for index in &self.spawn_failures {
            log::error!("worker {}: never started", index);
        }
        if self.aborted {
            log::error!("run aborted: the token ring was broken");
        }
        match self.conserved {
            Some(true) => log::info!("region contents conserved"),
            Some(false) => log::error!("region contents changed: bytes were created or lost"),
            None => {}
        }
        if let Some(entries) = &self.journal {
            log::info!(
                "{} critical sections, at most {} at once",
                entries.len(),
                journal::max_overlap(entries)
            );
            log::debug!("entry order: {:?}", journal::entry_order(entries));
        }
        log::info!("finished in {:?}", self.elapsed);
    }
}

/// Runs the whole protocol: create and prime the semaphore set, seed the
/// pool, spawn the workers, await them and tear down.
pub fn run<A: ipc::Adapter>(ctx: &ipc::Context<A>, config: &Config, swaps: u32) -> Result<Report> {
    let started = Instant::now();
    let semaphores = ctx
        .new_semaphore_set(config.semaphore_count())
        .context("failed to create semaphore set")?;
    semaphores
        .set_all(&initial_values(config))
        .context("failed to prime semaphores")?;
    let mut pool = ctx
        .new_region_pool(config.regions)
        .context("failed to allocate region pool")?;
    log::info!(
        "created {} semaphores and {} regions of {} bytes",
        semaphores.size(),
        pool.len(),
        ipc::REGION_SIZE
    );

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    seed_pool(&mut pool, &mut rng).context("failed to seed regions")?;
    let before = histogram(&pool)?;

    let journal = if config.journal {
        let capacity = config.workers * swaps as usize;
        Some(Journal::new(ctx, capacity).context("failed to allocate journal")?)
    } else {
        None
    };

    let semaphore_view = semaphores.handle();
    let region_view = pool.view();
    let mut teardown = Some(Teardown {
        semaphores,
        regions: pool,
    });
    let done = completion_index(config);
    let last = config.workers - 1;

    let mut handles: Vec<(usize, WorkerHandle)> = Vec::new();
    let mut spawn_failures = Vec::new();
    let mut aborted = false;
    for index in 0..config.workers {
        let (wait, signal) = assignment(config.variant, config.workers, index);
        let completion = match done {
            Some(done) if index == last => match teardown.take() {
                Some(teardown) => Completion::Cleanup {
                    done,
                    peers: handles.len(),
                    teardown,
                },
                None => Completion::Notify { done },
            },
            Some(done) => Completion::Notify { done },
            None => Completion::Exit,
        };
        let worker = Worker {
            index,
            semaphores: semaphore_view.clone(),
            regions: region_view.clone(),
            swaps,
            wait,
            signal,
            pair: (
                random_chunk(&mut rng, config.regions),
                random_chunk(&mut rng, config.regions),
            ),
            seed: rng.gen(),
            slowdown: config.slowdown.then(Slowdown::default),
            journal: journal.as_ref().map(Journal::writer),
            completion,
        };
        log::debug!("worker {} swaps {} <-> {}", index, worker.pair.0, worker.pair.1);
        if worker.is_cleanup_owner() {
            log::info!("worker {} owns teardown", index);
        }

        match ctx.spawn(worker) {
            Ok(handle) => handles.push((index, handle)),
            Err(rejected) => {
                let (worker, source) = rejected.into_parts();
                if let Some(recovered) = worker.into_teardown() {
                    log::warn!("cleanup owner did not start, the coordinator tears down instead");
                    teardown = Some(recovered);
                }
                spawn_failures.push(index);
                match config.variant {
                    Variant::Pool => log::warn!(
                        "worker {} failed to start ({}); continuing with fewer than {} workers",
                        index,
                        source,
                        config.workers
                    ),
                    Variant::Ring => {
                        log::error!(
                            "worker {} failed to start ({}); the token ring cannot complete",
                            index,
                            source
                        );
                        aborted = true;
                        break;
                    }
                }
            }
        }
    }

    // Destroying the set wakes every blocked ring member: removal fails
    // their acquire.
    let mut pool = None;
    let mut break_ring = |teardown: &mut Option<Teardown>| {
        if let Some(Teardown { semaphores, regions }) = teardown.take() {
            if let Err(e) = semaphores.destroy() {
                log::error!("failed to destroy semaphore set: {}", e);
            }
            pool = Some(regions);
        }
    };
    if aborted {
        break_ring(&mut teardown);
    }

    let ids: Vec<String> = handles.iter().map(|(_, handle)| handle.id().to_string()).collect();
    log::info!("[{}]: waiting on workers {}", std::process::id(), ids.join(" "));
    let ring = config.variant == Variant::Ring;
    let workers = reap(ctx, handles, |outcome| {
        if !ring || !outcome.strands_token() {
            return;
        }
        if teardown.is_some() {
            log::error!("worker {} left the token ring early, aborting", outcome.index);
            aborted = true;
            break_ring(&mut teardown);
        } else if !aborted {
            log::error!(
                "worker {} left the token ring early and the coordinator cannot tear down",
                outcome.index
            );
        }
    });

    let mut conserved = None;
    if let Some(teardown) = teardown {
        let after = histogram(&teardown.regions)?;
        conserved = Some(after == before);
        teardown.run().context("teardown failed")?;
    }
    if let Some(pool) = pool {
        pool.free().context("failed to free regions")?;
    }

    let entries = match journal {
        Some(journal) => {
            let entries = journal.entries();
            journal.free().context("failed to free journal")?;
            Some(entries)
        }
        None => None,
    };

    Ok(Report {
        workers,
        spawn_failures,
        aborted,
        conserved,
        journal: entries,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::config::BackendKind,
        ipc::threads,
    };

    fn config(variant: Variant, workers: usize) -> Config {
        Config {
            backend: BackendKind::Thread,
            variant,
            workers,
            swaps: None,
            permits: 1,
            regions: 4,
            cleanup: CleanupOwner::Coordinator,
            seed: Some(0x5eed),
            slowdown: true,
            journal: true,
        }
    }

    #[test]
    fn ring_hands_off_in_order() {
        let ctx = ipc::thread_context();
        let report = run(&ctx, &config(Variant::Ring, 5), 4).unwrap();
        assert!(report.success(), "{:?}", report);
        let entries = report.journal.unwrap();
        let expected: Vec<u32> = (0..4).flat_map(|_| 0..5).collect();
        assert_eq!(journal::entry_order(&entries), expected);
        assert_eq!(journal::max_overlap(&entries), 1);
    }

    #[test]
    fn process_ring_hands_off_in_order() {
        let ctx = ipc::sysv_context().unwrap();
        let config = Config {
            backend: BackendKind::Process,
            ..config(Variant::Ring, 5)
        };
        let report = run(&ctx, &config, 3).unwrap();
        assert!(report.success(), "{:?}", report);
        let entries = report.journal.unwrap();
        let expected: Vec<u32> = (0..3).flat_map(|_| 0..5).collect();
        assert_eq!(journal::entry_order(&entries), expected);
        assert_eq!(report.conserved, Some(true));
    }

    #[test]
    fn single_permit_pool_is_mutually_exclusive() {
        let ctx = ipc::thread_context();
        let report = run(&ctx, &config(Variant::Pool, 5), 10).unwrap();
        assert!(report.success(), "{:?}", report);
        let entries = report.journal.unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(journal::max_overlap(&entries), 1);
        assert_eq!(report.conserved, Some(true));
    }

    #[test]
    fn permits_bound_concurrency() {
        let ctx = ipc::thread_context();
        let config = Config {
            permits: 2,
            slowdown: false,
            ..config(Variant::Pool, 6)
        };
        let report = run(&ctx, &config, 20).unwrap();
        // Two permits let overlapping pairs race, so only the bound and the
        // workers themselves are checked, not conservation.
        assert!(report.workers.iter().all(Outcome::success), "{:?}", report);
        assert!(report.spawn_failures.is_empty());
        let entries = report.journal.unwrap();
        assert_eq!(entries.len(), 120);
        assert!(journal::max_overlap(&entries) <= 2);
    }

    #[test]
    fn coordinator_tears_down_once() {
        let ctx = ipc::thread_context();
        let config = Config {
            journal: false,
            ..config(Variant::Ring, 5)
        };
        let report = run(&ctx, &config, 3).unwrap();
        assert!(report.success(), "{:?}", report);
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
        assert_eq!(ctx.adapter().regions_freed(), 4);
    }

    #[test]
    fn last_worker_tears_down_once() {
        for variant in [Variant::Pool, Variant::Ring] {
            let ctx = ipc::thread_context();
            let config = Config {
                cleanup: CleanupOwner::LastWorker,
                journal: false,
                ..config(variant, 5)
            };
            let report = run(&ctx, &config, 3).unwrap();
            assert!(report.success(), "{:?}", report);
            assert_eq!(report.conserved, None);
            assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
            assert_eq!(ctx.adapter().regions_freed(), 4);
        }
    }

    #[test]
    fn pool_survives_spawn_failure() {
        let ctx = threads::new_context(threads::Backend::with_spawn_limit(3));
        let report = run(&ctx, &config(Variant::Pool, 5), 3).unwrap();
        assert!(!report.success());
        assert!(!report.aborted);
        assert_eq!(report.spawn_failures, vec![3, 4]);
        assert_eq!(report.workers.len(), 3);
        assert!(report.workers.iter().all(Outcome::success));
        assert_eq!(report.journal.unwrap().len(), 9);
        assert_eq!(report.conserved, Some(true));
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
    }

    #[test]
    fn ring_aborts_on_spawn_failure() {
        let ctx = threads::new_context(threads::Backend::with_spawn_limit(3));
        let config = Config {
            cleanup: CleanupOwner::LastWorker,
            ..config(Variant::Ring, 5)
        };
        let report = run(&ctx, &config, 3).unwrap();
        assert!(report.aborted);
        assert!(!report.success());
        assert_eq!(report.spawn_failures, vec![3]);
        assert_eq!(report.workers.len(), 3);
        assert!(report.workers.iter().all(|outcome| !outcome.success()));
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
        assert_eq!(ctx.adapter().regions_freed(), 5);
    }

    struct Vanish;

    impl ipc::Task for Vanish {
        fn run(self) -> i32 {
            panic!("ring member died")
        }
    }

    #[test]
    fn dead_ring_member_is_seen_while_peers_block() {
        let ctx = ipc::thread_context();
        let set = ctx.new_semaphore_set(2).unwrap();
        set.set_all(&[1, 0]).unwrap();
        let pool = ctx.new_region_pool(1).unwrap();
        let survivor = Worker {
            index: 0,
            semaphores: set.handle(),
            regions: pool.view(),
            swaps: 3,
            wait: 0,
            signal: 1,
            pair: (ChunkAddr::new(0, Chunk::A), ChunkAddr::new(0, Chunk::B)),
            seed: 1,
            slowdown: None,
            journal: None,
            completion: Completion::Exit,
        };
        let handles = vec![(0, ctx.spawn(survivor).unwrap()), (1, ctx.spawn(Vanish).unwrap())];

        // Without the teardown the survivor would wait for the token forever.
        let mut teardown = Some(Teardown {
            semaphores: set,
            regions: pool,
        });
        let mut stranded = Vec::new();
        let outcomes = reap(&ctx, handles, |outcome| {
            if outcome.strands_token() {
                stranded.push(outcome.index);
                if let Some(teardown) = teardown.take() {
                    teardown.run().unwrap();
                }
            }
        });

        assert_eq!(stranded, vec![1, 0]);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].index, 0);
        assert_eq!(outcomes[0].failed_stage(), Some(Stage::Acquire));
        assert_eq!(
            outcomes[1].status.as_ref().unwrap(),
            &ExitStatus::Exited(ipc::PANIC_EXIT_CODE)
        );
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
    }

    #[test]
    fn failed_swap_does_not_strand_the_token() {
        let outcome = |code| Outcome {
            index: 0,
            id: 0,
            status: Ok(ExitStatus::Exited(code)),
        };
        assert!(!outcome(0).strands_token());
        assert!(!outcome(Stage::CriticalSection.exit_code()).strands_token());
        assert!(outcome(Stage::Release.exit_code()).strands_token());
        assert!(outcome(ipc::PANIC_EXIT_CODE).strands_token());
    }

    #[test]
    fn coordinator_recovers_token_from_unstarted_owner() {
        let ctx = threads::new_context(threads::Backend::with_spawn_limit(4));
        let config = Config {
            cleanup: CleanupOwner::LastWorker,
            ..config(Variant::Pool, 5)
        };
        let report = run(&ctx, &config, 2).unwrap();
        assert_eq!(report.spawn_failures, vec![4]);
        assert!(report.workers.iter().all(Outcome::success));
        assert_eq!(report.conserved, Some(true));
        assert_eq!(ctx.adapter().semaphore_sets_removed(), 1);
    }

    #[test]
    fn slowdown_does_not_change_the_outcome() {
        let run_with = |slowdown| {
            let ctx = ipc::thread_context();
            let config = Config {
                slowdown,
                ..config(Variant::Ring, 3)
            };
            let report = run(&ctx, &config, 5).unwrap();
            assert!(report.success(), "{:?}", report);
            journal::entry_order(&report.journal.unwrap())
        };
        assert_eq!(run_with(true), run_with(false));
    }

    #[test]
    fn initial_values_prime_one_semaphore() {
        let ring = config(Variant::Ring, 4);
        assert_eq!(initial_values(&ring), vec![1, 0, 0, 0]);
        let pool = Config {
            permits: 3,
            cleanup: CleanupOwner::LastWorker,
            ..config(Variant::Pool, 4)
        };
        assert_eq!(initial_values(&pool), vec![3, 0]);
        assert_eq!(completion_index(&pool), Some(1));
        assert_eq!(assignment(Variant::Ring, 4, 3), (3, 0));
        assert_eq!(assignment(Variant::Pool, 4, 3), (0, 0));
    }
}
