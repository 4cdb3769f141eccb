//! resque-pool — a worker pool manager for Resque-style job queues.
//!
//! The pool forks one long-running worker per configured slot, each
//! assigned to an ordered list of queues, and keeps the live census
//! converged on a declarative YAML document. Operator signals drive the
//! lifecycle: QUIT/INT/TERM select the shutdown mode, HUP reloads the
//! configuration and rolls the workers, WINCH (when enabled) drains the
//! pool, and USR1/USR2/CONT are forwarded to every worker.

pub mod config;
pub mod logger;
pub mod platform;
pub mod pool;
pub mod worker;
