//! The core fuzzing loop: dry-run the initial corpus, then select, mutate,
//! execute and classify until a terminating signal arrives.

use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use libafl_bolts::{
    current_nanos,
    rands::StdRand,
    shmem::{ShMemProvider, UnixShMemProvider},
    Error,
};
use signal_hook::consts::TERM_SIGNALS;

use crate::{
    config::Config,
    corpus::{CorpusStore, SeedQueue},
    coverage::{CoverageMap, GlobalBitmap},
    executor::{ExitKind, TargetExecutor},
    mutation::MutationEngine,
    scheduler::{power_schedule, QueueStats, Scheduler},
};

/// How often the progress line is logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Running counters for the session, reported periodically.
#[derive(Debug)]
struct SessionStats {
    executions: u64,
    crashes: u64,
    timeouts: u64,
    started: Instant,
    last_report: Instant,
}

impl SessionStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            executions: 0,
            crashes: 0,
            timeouts: 0,
            started: now,
            last_report: now,
        }
    }

    fn maybe_report(&mut self, queue: &SeedQueue, global: &GlobalBitmap) {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = self.executions as f64 / elapsed.max(1.0);
        log::info!(
            "execs: {} ({rate:.0}/s), queue: {}, edges: {}, crashes: {}, timeouts: {}",
            self.executions,
            queue.len(),
            global.num_edges(),
            self.crashes,
            self.timeouts,
        );
    }
}

/// Owns every subsystem of one fuzzing session and wires them together.
pub struct Fuzzer {
    coverage: CoverageMap,
    global: GlobalBitmap,
    executor: TargetExecutor,
    store: CorpusStore,
    queue: SeedQueue,
    scheduler: Scheduler<StdRand>,
    engine: MutationEngine<StdRand>,
    stats: SessionStats,
}

impl Fuzzer {
    /// Sets up shared memory, the corpus directories and the fork server.
    pub fn new(config: Config) -> Result<Self, Error> {
        let mut shmem_provider = UnixShMemProvider::new()?;
        let coverage = CoverageMap::new(&mut shmem_provider)?;
        log::info!("created the coverage map, shm id {}", coverage.shm_id());

        let store = CorpusStore::open(&config)?;
        let executor = TargetExecutor::new(&config, &coverage.shm_id())?;

        Ok(Self {
            coverage,
            global: GlobalBitmap::new(),
            executor,
            store,
            queue: SeedQueue::new(),
            scheduler: Scheduler::new(StdRand::with_seed(current_nanos())),
            engine: MutationEngine::new(StdRand::with_seed(current_nanos())),
            stats: SessionStats::new(),
        })
    }

    /// Dry-runs the initial corpus and then fuzzes until a terminating
    /// signal is received.
    pub fn run(&mut self) -> Result<(), Error> {
        let stopping = Arc::new(AtomicBool::new(false));
        for signal in TERM_SIGNALS {
            signal_hook::flag::register(*signal, Arc::clone(&stopping))?;
        }

        self.dry_run()?;
        log::info!("dry run finished, starting the fuzzing loop, press Ctrl+C to stop");

        while !stopping.load(Ordering::Relaxed) {
            self.fuzz_one(&stopping)?;
        }

        log::info!(
            "session finished: {} executions, {} queue entries, {} unique edges, {} crashes",
            self.stats.executions,
            self.queue.len(),
            self.global.num_edges(),
            self.stats.crashes,
        );
        Ok(())
    }

    /// Executes every initial seed once. The initial corpus must be clean: a
    /// timeout or crash here ends the session.
    fn dry_run(&mut self) -> Result<(), Error> {
        let inputs = self.store.initial_inputs()?;
        if inputs.is_empty() {
            return Err(Error::illegal_state("the seed corpus is empty"));
        }

        for path in inputs {
            let data = fs::read(&path)?;
            self.coverage.reset();
            let execution = self.executor.run(&data)?;
            self.stats.executions += 1;

            match execution.exit_kind() {
                ExitKind::Timeout => {
                    return Err(Error::illegal_state(format!(
                        "seed {} timed out during the dry run",
                        path.display()
                    )));
                }
                ExitKind::Crash => {
                    return Err(Error::illegal_state(format!(
                        "seed {} crashed during the dry run (status {})",
                        path.display(),
                        execution.status_code
                    )));
                }
                ExitKind::Ok => {}
            }

            let scan = self.coverage.scan(&mut self.global);
            let seed = self.queue.add(
                path,
                scan.total_hits,
                execution.exec_time_us(),
                data.len() as u64,
            );
            log::info!("dry run accepted {seed}");
        }
        Ok(())
    }

    /// One scheduling round: select a seed, derive its power, then mutate
    /// and execute that many times.
    fn fuzz_one(&mut self, stopping: &AtomicBool) -> Result<(), Error> {
        let Some(index) = self
            .scheduler
            .select_next(&mut self.queue, self.global.num_edges())
        else {
            return Err(Error::illegal_state("the seed queue is empty"));
        };
        let stats = QueueStats::collect(&self.queue);
        let power = power_schedule(self.queue.get(index), &stats);
        log::debug!("selected {} with power {power}", self.queue.get(index));

        for _ in 0..power {
            if stopping.load(Ordering::Relaxed) {
                break;
            }

            let input = self.engine.generate(self.queue.get(index), &self.queue)?;
            self.coverage.reset();
            let execution = self.executor.run(&input)?;
            self.stats.executions += 1;

            match execution.exit_kind() {
                ExitKind::Timeout => {
                    self.stats.timeouts += 1;
                    log::debug!("timeout, skipping this input");
                    continue;
                }
                ExitKind::Crash => {
                    self.stats.crashes += 1;
                    let path = self.store.save_crash(&input)?;
                    log::info!(
                        "found a crash (status {}), saved as {}",
                        execution.status_code,
                        path.display()
                    );
                    continue;
                }
                ExitKind::Ok => {}
            }

            let scan = self.coverage.scan(&mut self.global);
            log::debug!("covered {} edges", scan.total_hits);
            if scan.new_edge {
                let path = self.store.save_queue_input(&input)?;
                let seed = self.queue.add(
                    path,
                    scan.total_hits,
                    execution.exec_time_us(),
                    input.len() as u64,
                );
                log::info!(
                    "new edge covered by {seed}, {} unique edges so far",
                    self.global.num_edges()
                );
            }

            self.stats.maybe_report(&self.queue, &self.global);
        }
        Ok(())
    }
}
