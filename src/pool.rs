//! The pool supervisor: keeps the live worker census converged on the
//! configured counts and translates operator signals into lifecycle
//! actions.
//!
//! The supervisor is single-threaded. The only asynchronous activity is
//! the kernel delivering signals into the platform's queue; everything
//! else happens inside one loop iteration: reap, drain one signal,
//! reconcile, sleep.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context as _, Result};
use indexmap::IndexSet;
use tracing::debug;

use crate::config::Config;
use crate::logger::Logger;
use crate::platform::{self, ChildExit, Forked, Pid, Platform, Sig};
use crate::worker::{AfterPrefork, WorkerFactory};

/// Signals the supervisor traps. CHLD is trapped only so a dying child
/// interrupts `sleep`; its queue entry is discarded, and reaping happens
/// at the top of every iteration regardless.
pub const SUPERVISED_SIGNALS: [Sig; 9] = [
    Sig::Quit,
    Sig::Int,
    Sig::Term,
    Sig::Usr1,
    Sig::Usr2,
    Sig::Cont,
    Sig::Hup,
    Sig::Winch,
    Sig::Chld,
];

/// What TERM does to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermBehavior {
    /// Forward TERM to the workers and leave immediately.
    #[default]
    Immediate,
    /// Graceful worker shutdown; do not wait for the workers.
    Graceful,
    /// Graceful worker shutdown, waiting for every worker to exit.
    GracefulAndWait,
}

#[derive(Default)]
pub struct PoolOptions {
    /// Application tag used in log prefixes and process titles.
    pub app_name: String,
    pub term_behavior: TermBehavior,
    /// Drain all workers on WINCH instead of ignoring it.
    pub handle_winch: bool,
    /// Hook run in each child between fork and the worker body.
    pub after_prefork: Option<AfterPrefork>,
}

pub struct Pool<P: Platform, F: WorkerFactory> {
    platform: P,
    config: Config,
    factory: F,
    logger: Logger,
    options: PoolOptions,
    /// Live children per queue-combination key, in spawn order. A pid
    /// lives under exactly one key from fork success until it is reaped.
    census: BTreeMap<String, IndexSet<Pid>>,
    final_signal: Option<Sig>,
}

impl<P: Platform, F: WorkerFactory> Pool<P, F> {
    pub fn new(
        platform: P,
        config: Config,
        factory: F,
        logger: Logger,
        options: PoolOptions,
    ) -> Pool<P, F> {
        Pool {
            platform,
            config,
            factory,
            logger: logger.with_role("manager"),
            options,
            census: BTreeMap::new(),
            final_signal: None,
        }
    }

    /// Bring the pool up: load configuration, install the signal trap,
    /// run the first reconciliation.
    pub fn start(&mut self) -> Result<()> {
        self.procline("(starting)");
        self.config.initialize(&self.logger)?;
        self.platform.install_signal_trap(&SUPERVISED_SIGNALS)?;
        self.logger.info("started manager", &[]);
        self.maintain_worker_count()?;
        self.report_worker_pool_pids();
        Ok(())
    }

    /// Supervisor loop. Returns once a terminating signal has been
    /// handled; the final process exit code is [`exit_status`].
    ///
    /// [`exit_status`]: Pool::exit_status
    pub fn join(&mut self) -> Result<()> {
        loop {
            self.reap_all_workers(false);
            if let Some(sig) = self.platform.next_signal() {
                if self.handle_signal(sig)? {
                    break;
                }
            }
            if self.platform.pending_signals() == 0 {
                self.maintain_worker_count()?;
                self.platform.sleep(self.config.interval);
            }
            self.procline(&format!("managing {:?}", self.all_pids()));
        }
        self.procline("(shutting down)");
        self.logger.info("manager finished", &[]);
        Ok(())
    }

    /// Final process exit code: 0, unless the quit path asked for the
    /// conventional signal-derived code.
    pub fn exit_status(&self) -> i32 {
        match self.final_signal {
            Some(sig) if self.platform.quit_on_exit_signal() => 128 + sig.as_raw(),
            _ => 0,
        }
    }

    /// Dispatch one queued signal. Returns true when the loop should end.
    fn handle_signal(&mut self, sig: Sig) -> Result<bool> {
        match sig {
            Sig::Usr1 | Sig::Usr2 | Sig::Cont => {
                self.logger.info(
                    "{signal}: sending to all workers",
                    &[("signal", sig.to_string())],
                );
                self.signal_all_workers(sig);
                Ok(false)
            }
            Sig::Hup => {
                self.logger
                    .info("HUP: reload configuration and restart workers", &[]);
                self.config.reload(&self.logger);
                // Old workers finish their current job and exit; the
                // reconciliation loop replaces them as they are reaped.
                self.signal_all_workers(Sig::Quit);
                Ok(false)
            }
            Sig::Winch => {
                if self.options.handle_winch {
                    self.logger
                        .info("WINCH: gracefully stopping all workers", &[]);
                    self.config.reset_queues();
                    self.maintain_worker_count()?;
                }
                Ok(false)
            }
            Sig::Quit => {
                self.final_signal = Some(sig);
                self.platform.set_quit_on_exit_signal(true);
                self.graceful_shutdown_and_wait(sig);
                Ok(true)
            }
            Sig::Int => {
                self.final_signal = Some(sig);
                self.graceful_shutdown(sig);
                Ok(true)
            }
            Sig::Term => {
                self.final_signal = Some(sig);
                match self.options.term_behavior {
                    TermBehavior::GracefulAndWait => self.graceful_shutdown_and_wait(sig),
                    TermBehavior::Graceful => self.graceful_shutdown(sig),
                    TermBehavior::Immediate => {
                        self.logger.info(
                            "TERM: immediate shutdown (and immediate worker shutdown)",
                            &[],
                        );
                        self.signal_all_workers(Sig::Term);
                    }
                }
                Ok(true)
            }
            Sig::Chld => Ok(false),
        }
    }

    fn graceful_shutdown_and_wait(&mut self, sig: Sig) {
        self.logger.info(
            "{signal}: graceful shutdown, waiting for children",
            &[("signal", sig.to_string())],
        );
        self.signal_all_workers(Sig::Quit);
        self.reap_all_workers(true);
    }

    fn graceful_shutdown(&mut self, sig: Sig) {
        self.logger.info(
            "{signal}: immediate shutdown (graceful worker shutdown)",
            &[("signal", sig.to_string())],
        );
        self.signal_all_workers(Sig::Quit);
    }

    /// Reconcile the census with the desired counts: fork what is
    /// missing, gracefully quit what is surplus (oldest first).
    pub fn maintain_worker_count(&mut self) -> Result<()> {
        for queues in self.all_known_queues() {
            let desired = self.config.worker_count(&queues) as i64;
            let live = self.census.get(&queues).map_or(0, IndexSet::len) as i64;
            let delta = desired - live;
            if delta > 0 {
                debug!(%queues, delta, "spawning workers");
                for _ in 0..delta {
                    self.spawn_worker(&queues)?;
                }
            } else if delta < 0 {
                let doomed: Vec<Pid> = self.census.get(&queues).map_or_else(Vec::new, |pids| {
                    pids.iter().take(-delta as usize).copied().collect()
                });
                self.logger.info(
                    "too many {queues} workers, sending QUIT to {pids}",
                    &[
                        ("queues", queues.clone()),
                        ("pids", format!("{doomed:?}")),
                    ],
                );
                self.platform.signal_pids(&doomed, Sig::Quit);
            }
        }
        Ok(())
    }

    fn spawn_worker(&mut self, queues: &str) -> Result<()> {
        match self.platform.fork() {
            Ok(Forked::Parent(pid)) => {
                self.census
                    .entry(queues.to_string())
                    .or_default()
                    .insert(pid);
                debug!(pid, queues, "spawned worker");
                Ok(())
            }
            Ok(Forked::Child) => self.run_worker(queues),
            Err(err) => {
                self.logger
                    .error("fork failed: {error}", &[("error", format!("{err:#}"))]);
                Err(err).context("spawn worker")
            }
        }
    }

    /// Child side of the fork. Never returns to the supervisor loop.
    fn run_worker(&mut self, queues: &str) -> ! {
        self.platform.release_signals();
        let list: Vec<String> = queues.split(',').map(str::to_string).collect();
        platform::set_process_title(&format!(
            "resque-pool-worker{}: {queues}",
            self.app_tag()
        ));
        let mut worker = self.factory.create(list, self.logger.clone().with_role("worker"));
        if let Some(hook) = &self.options.after_prefork {
            hook(worker.as_mut());
        }
        if let Err(err) = worker.work(self.config.interval) {
            self.logger.error(
                "worker failed: {error}",
                &[
                    ("role", "worker".to_string()),
                    ("error", format!("{err:#}")),
                ],
            );
        }
        platform::exit_child(0)
    }

    /// Remove exited children from the census. Non-blocking unless
    /// `wait`, in which case it drains every remaining child.
    pub fn reap_all_workers(&mut self, wait: bool) {
        while let Some(ChildExit { pid, status }) = self.platform.next_dead_child(wait) {
            match self.delete_worker(pid) {
                Some(queues) => self.logger.info(
                    "reaped worker {pid} ({status}), was working {queues}",
                    &[
                        ("pid", pid.to_string()),
                        ("status", status.to_string()),
                        ("queues", queues),
                    ],
                ),
                None => self.logger.notice(
                    "reaped unknown child {pid} ({status})",
                    &[("pid", pid.to_string()), ("status", status.to_string())],
                ),
            }
        }
    }

    fn delete_worker(&mut self, pid: Pid) -> Option<String> {
        let key = self
            .census
            .iter()
            .find(|(_, pids)| pids.contains(&pid))
            .map(|(key, _)| key.clone())?;
        if let Some(pids) = self.census.get_mut(&key) {
            pids.shift_remove(&pid);
            if pids.is_empty() {
                self.census.remove(&key);
            }
        }
        Some(key)
    }

    /// Pids across every queue key, in key order then spawn order.
    pub fn all_pids(&self) -> Vec<Pid> {
        self.census.values().flatten().copied().collect()
    }

    /// The queue-combination key a live worker belongs to.
    pub fn worker_queues(&self, pid: Pid) -> Option<&str> {
        self.census
            .iter()
            .find(|(_, pids)| pids.contains(&pid))
            .map(|(key, _)| key.as_str())
    }

    /// Configured keys plus keys still occupied by live workers, so a key
    /// removed from the configuration is still driven down to zero.
    pub fn all_known_queues(&self) -> Vec<String> {
        let mut keys: BTreeSet<String> = self
            .config
            .known_queues()
            .into_iter()
            .map(str::to_string)
            .collect();
        keys.extend(self.census.keys().cloned());
        keys.into_iter().collect()
    }

    pub fn report_worker_pool_pids(&self) {
        self.logger.info(
            "Pool contains worker PIDs: {pids}",
            &[("pids", format!("{:?}", self.all_pids()))],
        );
    }

    fn signal_all_workers(&mut self, sig: Sig) {
        let pids = self.all_pids();
        self.platform.signal_pids(&pids, sig);
    }

    fn app_tag(&self) -> String {
        if self.options.app_name.is_empty() {
            String::new()
        } else {
            format!("[{}]", self.options.app_name)
        }
    }

    fn procline(&self, state: &str) {
        platform::set_process_title(&format!("resque-pool-manager{}: {state}", self.app_tag()));
    }
}
