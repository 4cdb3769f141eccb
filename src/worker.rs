//! The job-execution seam: what runs inside each forked child.
//!
//! The supervisor does not know how jobs are dequeued or run; it only
//! builds a worker for a queue list and hands it the polling interval.
//! The shipped binary uses [`ExecWorkerFactory`], which replaces the child
//! image with an operator-supplied command.

use std::time::Duration;

use anyhow::{Context as _, Result};

use crate::logger::Logger;

/// A worker's main body. Runs in the forked child until its backend tells
/// it to stop; the supervisor only ever sees the child's exit status.
pub trait Worker {
    /// Queue names this worker polls, in priority order.
    fn queues(&self) -> &[String];

    fn work(&mut self, interval: Duration) -> Result<()>;
}

/// Builds the worker a freshly forked child will run. Supplied at pool
/// construction; receives the comma-split queue list (order preserved) and
/// the logger workers log through.
pub trait WorkerFactory {
    fn create(&self, queues: Vec<String>, logger: Logger) -> Box<dyn Worker>;
}

/// Caller-supplied hook run in the child between fork and the worker body.
/// The child is a copy of the supervisor: nothing the hook mutates
/// propagates back to the parent.
pub type AfterPrefork = Box<dyn Fn(&mut dyn Worker)>;

/// Factory for workers that exec an external command.
pub struct ExecWorkerFactory {
    command: Vec<String>,
}

impl ExecWorkerFactory {
    pub fn new(command: Vec<String>) -> ExecWorkerFactory {
        ExecWorkerFactory { command }
    }
}

impl WorkerFactory for ExecWorkerFactory {
    fn create(&self, queues: Vec<String>, logger: Logger) -> Box<dyn Worker> {
        Box::new(ExecWorker {
            command: self.command.clone(),
            queues,
            logger,
        })
    }
}

/// Replaces the child image with the configured command. The command reads
/// its queue list and polling interval from the environment (`QUEUES`,
/// `INTERVAL`), the conventions queue workers already understand.
struct ExecWorker {
    command: Vec<String>,
    queues: Vec<String>,
    logger: Logger,
}

impl Worker for ExecWorker {
    fn queues(&self) -> &[String] {
        &self.queues
    }

    fn work(&mut self, interval: Duration) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let program = self.command.first().context("empty worker command")?;
        let queues = self.queues.join(",");
        self.logger
            .debug("starting {queues} worker", &[("queues", queues.clone())]);

        // exec only returns on failure.
        let err = std::process::Command::new(program)
            .args(&self.command[1..])
            .env("QUEUES", queues)
            .env("INTERVAL", format!("{}", interval.as_secs_f64()))
            .exec();
        Err(err).with_context(|| format!("exec worker command {program:?}"))
    }
}
