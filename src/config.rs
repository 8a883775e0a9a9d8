use {
    anyhow::{anyhow, bail, Context, Result},
    std::str::FromStr,
};

pub const USAGE: &str = "\
usage: chunk-swap [options]

  --backend process|thread        how workers are run (default: process)
  --variant pool|ring             shared permit pool or token ring (default: ring)
  --workers N                     number of workers (default: 5)
  --swaps N                       swaps per worker (prompted for if omitted)
  --permits K                     permits in the pool variant (default: 1)
  --regions N                     shared regions in the pool (default: 4)
  --cleanup coordinator|last-worker
                                  who destroys the shared resources (default: coordinator)
  --seed N                        seed for region contents and chunk selection
  --no-slowdown                   disable random delays before each critical section
  --journal                       record and verify every critical section
  --help                          print this message
";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Process,
    Thread,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Every worker contends on one semaphore primed with `permits`.
    Pool,
    /// Worker `i` waits on semaphore `i` and signals `(i + 1) % workers`.
    Ring,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CleanupOwner {
    Coordinator,
    LastWorker,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(BackendKind::Process),
            "thread" => Ok(BackendKind::Thread),
            other => bail!("unknown backend '{}', expected process or thread", other),
        }
    }
}

impl FromStr for Variant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pool" => Ok(Variant::Pool),
            "ring" => Ok(Variant::Ring),
            other => bail!("unknown variant '{}', expected pool or ring", other),
        }
    }
}

impl FromStr for CleanupOwner {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coordinator" => Ok(CleanupOwner::Coordinator),
            "last-worker" => Ok(CleanupOwner::LastWorker),
            other => bail!(
                "unknown cleanup owner '{}', expected coordinator or last-worker",
                other
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub backend: BackendKind,
    pub variant: Variant,
    pub workers: usize,
    pub swaps: Option<u32>,
    pub permits: u16,
    pub regions: usize,
    pub cleanup: CleanupOwner,
    pub seed: Option<u64>,
    pub slowdown: bool,
    pub journal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendKind::Process,
            variant: Variant::Ring,
            workers: 5,
            swaps: None,
            permits: 1,
            regions: 4,
            cleanup: CleanupOwner::Coordinator,
            seed: None,
            slowdown: true,
            journal: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        if self.regions == 0 {
            bail!("at least one region is required");
        }
        if self.permits == 0 {
            bail!("the permit pool needs at least one permit");
        }
        if self.permits > ipc::MAX_SEMAPHORE_VALUE {
            bail!(
                "at most {} permits fit in one semaphore, got {}",
                ipc::MAX_SEMAPHORE_VALUE,
                self.permits
            );
        }
        if self.swaps == Some(0) {
            bail!("the number of swaps must be positive");
        }
        if self.semaphore_count() > u16::MAX as usize {
            bail!("{} workers need more semaphores than one set can hold", self.workers);
        }
        Ok(())
    }

    /// Size of the semaphore set: one per ring member or one shared pool
    /// semaphore, plus the completion semaphore when a worker tears down.
    pub fn semaphore_count(&self) -> usize {
        let protocol = match self.variant {
            Variant::Pool => 1,
            Variant::Ring => self.workers,
        };
        match self.cleanup {
            CleanupOwner::Coordinator => protocol,
            CleanupOwner::LastWorker => protocol + 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Run(Config),
    Help,
}

fn value<T>(flag: &str, args: &mut impl Iterator<Item = String>) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = args
        .next()
        .ok_or_else(|| anyhow!("{} expects a value", flag))?;
    raw.parse::<T>()
        .map_err(|e| anyhow!("{}", e))
        .with_context(|| format!("invalid value '{}' for {}", raw, flag))
}

pub fn parse<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut args = args.into_iter();
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--backend" => config.backend = value(&flag, &mut args)?,
            "--variant" => config.variant = value(&flag, &mut args)?,
            "--workers" => config.workers = value(&flag, &mut args)?,
            "--swaps" => config.swaps = Some(value(&flag, &mut args)?),
            "--permits" => config.permits = value(&flag, &mut args)?,
            "--regions" => config.regions = value(&flag, &mut args)?,
            "--cleanup" => config.cleanup = value(&flag, &mut args)?,
            "--seed" => config.seed = Some(value(&flag, &mut args)?),
            "--no-slowdown" => config.slowdown = false,
            "--journal" => config.journal = true,
            "-h" | "--help" => return Ok(Command::Help),
            other => bail!("unknown option '{}'\n\n{}", other, USAGE),
        }
    }
    config.validate()?;
    Ok(Command::Run(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn defaults() {
        assert_eq!(parse(args("")).unwrap(), Command::Run(Config::default()));
        assert_eq!(Config::default().semaphore_count(), 5);
    }

    #[test]
    fn every_option() {
        let command = parse(args(
            "--backend thread --variant pool --workers 8 --swaps 3 --permits 2 \
             --regions 6 --cleanup last-worker --seed 42 --no-slowdown --journal",
        ))
        .unwrap();
        let expected = Config {
            backend: BackendKind::Thread,
            variant: Variant::Pool,
            workers: 8,
            swaps: Some(3),
            permits: 2,
            regions: 6,
            cleanup: CleanupOwner::LastWorker,
            seed: Some(42),
            slowdown: false,
            journal: true,
        };
        assert_eq!(expected.semaphore_count(), 2);
        assert_eq!(command, Command::Run(expected));
    }

    #[test]
    fn help() {
        assert_eq!(parse(args("--workers 2 --help")).unwrap(), Command::Help);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(args("--frobnicate")).is_err());
        assert!(parse(args("--workers")).is_err());
        assert!(parse(args("--workers many")).is_err());
        assert!(parse(args("--workers 0")).is_err());
        assert!(parse(args("--swaps 0")).is_err());
        assert!(parse(args("--permits 0")).is_err());
        assert!(parse(args("--permits 40000")).is_err());
        assert!(parse(args("--variant pool --permits 32767")).is_ok());
        assert!(parse(args("--variant star")).is_err());
        assert!(parse(args("--cleanup everyone")).is_err());
        assert!(parse(args("--variant ring --workers 70000")).is_err());
    }

    #[test]
    fn ring_with_worker_cleanup_adds_a_completion_semaphore() {
        let config = Config {
            workers: 5,
            variant: Variant::Ring,
            cleanup: CleanupOwner::LastWorker,
            ..Config::default()
        };
        assert_eq!(config.semaphore_count(), 6);
    }
}
