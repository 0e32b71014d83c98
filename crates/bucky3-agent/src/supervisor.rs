//! Worker supervision: start, watch, restart, detect crash loops, shut
//! everything down on demand.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bucky3_core::worker::ShutdownFlag;
use tracing::{debug, error, info, warn};

use crate::wiring::WorkerSpec;

/// Supervision timing; the defaults are the production values, tests dial
/// them down.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Pause between health-check passes.
    pub healthcheck_interval: Duration,
    /// A worker that exited sooner than this after its start is not
    /// restarted until the next pass.
    pub restart_holdoff: Duration,
    /// Grace period per worker at shutdown before it is abandoned.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            healthcheck_interval: Duration::from_secs(3),
            restart_holdoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// How many start timestamps are kept per worker.
const START_RING: usize = 10;

/// With the start ring full, a mean spacing below this means the worker
/// cannot hold itself up and the whole process should die loudly instead of
/// spinning.
const CRASH_LOOP_MEAN: Duration = Duration::from_secs(60);

struct WorkerState {
    spec: WorkerSpec,
    starts: Vec<Instant>,
    handle: Option<JoinHandle<()>>,
    instance_shutdown: Option<ShutdownFlag>,
}

impl WorkerState {
    fn crash_looping(&self) -> bool {
        if self.starts.len() < START_RING {
            return false;
        }
        let spacing: Duration = self
            .starts
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .sum();
        let mean = spacing / (self.starts.len() as u32 - 1);
        mean < CRASH_LOOP_MEAN
    }
}

pub struct Supervisor {
    workers: Vec<WorkerState>,
    options: SupervisorOptions,
    shutdown: ShutdownFlag,
}

impl Supervisor {
    pub fn new(specs: Vec<WorkerSpec>, options: SupervisorOptions, shutdown: ShutdownFlag) -> Self {
        let workers = specs
            .into_iter()
            .map(|spec| WorkerState {
                spec,
                starts: Vec::new(),
                handle: None,
                instance_shutdown: None,
            })
            .collect();
        Self {
            workers,
            options,
            shutdown,
        }
    }

    /// Supervise until a termination signal or an unrecoverable worker.
    /// Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        loop {
            if self.shutdown.is_set() {
                return self.shutdown_workers();
            }
            if self.healthcheck() > 0 {
                self.shutdown_workers();
                return 1;
            }
            self.sleep(self.options.healthcheck_interval);
        }
    }

    /// One pass over the worker table. Returns the number of unrecoverable
    /// workers found.
    fn healthcheck(&mut self) -> usize {
        let mut unrecoverable = 0;

        for worker in &mut self.workers {
            match &worker.handle {
                None => start(worker),
                Some(handle) if handle.is_finished() => {
                    let handle = worker.handle.take().unwrap();
                    match handle.join() {
                        Ok(()) => info!("{} has stopped", worker.spec.name),
                        Err(_) => error!("{} crashed", worker.spec.name),
                    }
                    // Stop any helper threads the dead instance left behind.
                    if let Some(flag) = worker.instance_shutdown.take() {
                        flag.set();
                    }

                    if worker.crash_looping() {
                        error!("{} keeps failing, cannot recover", worker.spec.name);
                        unrecoverable += 1;
                        continue;
                    }
                    let too_soon = worker
                        .starts
                        .last()
                        .is_some_and(|last| last.elapsed() < self.options.restart_holdoff);
                    if too_soon {
                        warn!("{} has stopped, too early for restart", worker.spec.name);
                    } else {
                        info!("{} has stopped, restarting", worker.spec.name);
                        start(worker);
                    }
                }
                Some(_) => debug!("{} is up", worker.spec.name),
            }
        }
        unrecoverable
    }

    /// Orderly shutdown: signal every worker, give each the grace period,
    /// abandon the stragglers. Non-zero when anything had to be abandoned.
    fn shutdown_workers(&mut self) -> i32 {
        info!("shutting down");
        for worker in &self.workers {
            if let Some(flag) = &worker.instance_shutdown {
                flag.set();
            }
        }

        let mut abandoned = 0;
        for worker in &mut self.workers {
            let Some(handle) = worker.handle.take() else {
                continue;
            };
            let deadline = Instant::now() + self.options.shutdown_grace;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
                info!("{} stopped", worker.spec.name);
            } else {
                warn!("{} still running, abandoning", worker.spec.name);
                abandoned += 1;
            }
        }

        if abandoned > 0 { 1 } else { 0 }
    }

    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.shutdown.is_set() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return;
            }
            std::thread::sleep(left.min(Duration::from_millis(100)));
        }
    }
}

fn start(worker: &mut WorkerState) {
    info!("starting {}", worker.spec.name);
    worker.starts.push(Instant::now());
    if worker.starts.len() > START_RING {
        let excess = worker.starts.len() - START_RING;
        worker.starts.drain(..excess);
    }

    let instance_shutdown = ShutdownFlag::new();
    worker.handle = Some((worker.spec.factory)(instance_shutdown.clone()));
    worker.instance_shutdown = Some(instance_shutdown);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::wiring::WorkerFactory;

    fn test_options() -> SupervisorOptions {
        SupervisorOptions {
            healthcheck_interval: Duration::from_millis(5),
            restart_holdoff: Duration::ZERO,
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn spec_with(factory: WorkerFactory) -> WorkerSpec {
        WorkerSpec {
            name: "test-worker".to_string(),
            factory,
        }
    }

    #[test]
    fn crash_loop_detected_after_ten_fast_starts() {
        let starts = Arc::new(AtomicUsize::new(0));
        let factory: WorkerFactory = {
            let starts = Arc::clone(&starts);
            Arc::new(move |_shutdown| {
                starts.fetch_add(1, Ordering::SeqCst);
                // Exits immediately: the pathological worker.
                std::thread::spawn(|| {})
            })
        };

        let mut supervisor = Supervisor::new(
            vec![spec_with(factory)],
            test_options(),
            ShutdownFlag::new(),
        );
        let code = supervisor.run();

        assert_eq!(code, 1);
        assert_eq!(starts.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn healthy_worker_is_left_alone() {
        let starts = Arc::new(AtomicUsize::new(0));
        let factory: WorkerFactory = {
            let starts = Arc::clone(&starts);
            Arc::new(move |shutdown: ShutdownFlag| {
                starts.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    while !shutdown.is_set() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                })
            })
        };

        let shutdown = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(
            vec![spec_with(factory)],
            test_options(),
            shutdown.clone(),
        );

        let signal = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                shutdown.set();
            })
        };
        let code = supervisor.run();
        signal.join().unwrap();

        assert_eq!(code, 0);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_few_crashes_only_restart() {
        // Crashes a handful of times, then stays up: recoverable.
        let starts = Arc::new(AtomicUsize::new(0));
        let factory: WorkerFactory = {
            let starts = Arc::clone(&starts);
            Arc::new(move |shutdown: ShutdownFlag| {
                let nth = starts.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    if nth < 5 {
                        return;
                    }
                    while !shutdown.is_set() {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                })
            })
        };

        let shutdown = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(
            vec![spec_with(factory)],
            test_options(),
            shutdown.clone(),
        );

        let signal = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                shutdown.set();
            })
        };
        let code = supervisor.run();
        signal.join().unwrap();

        assert_eq!(code, 0);
        assert_eq!(starts.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn straggler_is_abandoned_and_reflected_in_exit_code() {
        let factory: WorkerFactory = Arc::new(move |_shutdown| {
            // Never observes the shutdown flag.
            std::thread::spawn(|| std::thread::sleep(Duration::from_secs(3600)))
        });

        let shutdown = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(
            vec![spec_with(factory)],
            SupervisorOptions {
                shutdown_grace: Duration::from_millis(50),
                ..test_options()
            },
            shutdown.clone(),
        );

        shutdown.set();
        // One pass starts nothing because shutdown is already set.
        assert_eq!(supervisor.run(), 0);

        // Start it, then shut down: the sleeper cannot finish in time.
        let mut supervisor = Supervisor::new(
            vec![spec_with(Arc::new(|_| {
                std::thread::spawn(|| std::thread::sleep(Duration::from_secs(3600)))
            }))],
            SupervisorOptions {
                shutdown_grace: Duration::from_millis(50),
                ..test_options()
            },
            shutdown.clone(),
        );
        supervisor.healthcheck();
        assert_eq!(supervisor.run(), 1);
    }
}
