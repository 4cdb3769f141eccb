//! Integration tests driving the compiled resque-pool binary.
//!
//! Each test starts a real pool in a temporary directory with its stdout
//! redirected to a file, waits for the startup report line (the signal
//! trap is installed before it is printed), then exercises a signal-driven
//! lifecycle path and checks the exit status and log lines.

#![cfg(unix)]

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Path to the compiled binary.
fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_resque-pool")
}

/// A running pool in an isolated temporary working directory. Workers run
/// `sleep 60`, so they stay alive until signaled.
struct PoolHarness {
    _tmp: tempfile::TempDir,
    child: Child,
    log_path: PathBuf,
}

impl PoolHarness {
    fn spawn(config_yaml: Option<&str>, extra_args: &[&str]) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        if let Some(yaml) = config_yaml {
            std::fs::write(tmp.path().join("resque-pool.yml"), yaml).expect("write config");
        }

        let log_path = tmp.path().join("pool.log");
        let log = std::fs::File::create(&log_path).expect("create log file");
        let child = Command::new(binary())
            .current_dir(tmp.path())
            .args(extra_args)
            .args(["--", "sleep", "60"])
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn resque-pool");

        PoolHarness {
            _tmp: tmp,
            child,
            log_path,
        }
    }

    fn log(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }

    /// Block until the pool has reported its worker pids (which happens
    /// after the signal trap is installed), and return that report line.
    fn wait_for_startup(&mut self) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(line) = self
                .log()
                .lines()
                .find(|line| line.contains("Pool contains worker PIDs"))
            {
                return line.to_string();
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                panic!("pool exited during startup: {status}\nlog:\n{}", self.log());
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        panic!("pool did not report startup in time\nlog:\n{}", self.log());
    }

    fn signal(&self, signum: i32) {
        // SAFETY: kill(2) with a pid we own and a valid signal number.
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, signum) };
        assert_eq!(rc, 0, "failed to signal pool");
    }

    fn wait_for_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + Duration::from_secs(15);
        while Instant::now() < deadline {
            match self.child.try_wait().expect("wait for pool") {
                Some(status) => return status,
                None => std::thread::sleep(Duration::from_millis(25)),
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        panic!("pool did not exit in time\nlog:\n{}", self.log());
    }
}

/// Worker count reported by a `Pool contains worker PIDs: [..]` line.
fn reported_pids(report: &str) -> usize {
    let inner = report
        .split('[')
        .next_back()
        .and_then(|s| s.split(']').next())
        .unwrap_or_default()
        .trim();
    if inner.is_empty() {
        0
    } else {
        inner.split(',').count()
    }
}

#[test]
fn idle_pool_shuts_down_cleanly_on_int() {
    let mut pool = PoolHarness::spawn(None, &[]);
    let report = pool.wait_for_startup();
    assert_eq!(reported_pids(&report), 0, "report: {report}");

    pool.signal(libc::SIGINT);
    let status = pool.wait_for_exit();
    assert_eq!(status.code(), Some(0), "log:\n{}", pool.log());

    let log = pool.log();
    assert!(log.contains("resque-pool-manager"), "log:\n{log}");
    assert!(log.contains("started manager"), "log:\n{log}");
    assert!(
        log.contains("INT: immediate shutdown (graceful worker shutdown)"),
        "log:\n{log}"
    );
    assert!(log.contains("manager finished"), "log:\n{log}");
}

#[test]
fn quit_waits_for_workers_and_exits_with_quit_code() {
    let mut pool = PoolHarness::spawn(Some("one: 2\n"), &[]);
    let report = pool.wait_for_startup();
    assert_eq!(reported_pids(&report), 2, "report: {report}");

    pool.signal(libc::SIGQUIT);
    let status = pool.wait_for_exit();
    assert_eq!(status.code(), Some(128 + libc::SIGQUIT), "log:\n{}", pool.log());

    let log = pool.log();
    assert!(
        log.contains("QUIT: graceful shutdown, waiting for children"),
        "log:\n{log}"
    );
    assert_eq!(
        log.matches("reaped worker").count(),
        2,
        "log:\n{log}"
    );
    assert!(log.contains("manager finished"), "log:\n{log}");
}

#[test]
fn environment_overlay_drives_worker_counts() {
    let yaml = "foo: 1\nproduction:\n  foo: 3\n";
    let mut pool = PoolHarness::spawn(Some(yaml), &["-E", "production"]);
    let report = pool.wait_for_startup();
    assert_eq!(reported_pids(&report), 3, "report: {report}");

    pool.signal(libc::SIGINT);
    assert_eq!(pool.wait_for_exit().code(), Some(0));
}

#[test]
fn missing_explicit_config_falls_back_to_defaults() {
    let mut pool = PoolHarness::spawn(None, &["-c", "missing.yml"]);
    let report = pool.wait_for_startup();
    assert_eq!(reported_pids(&report), 0, "report: {report}");

    let log = pool.log();
    assert!(log.contains("config file not found"), "log:\n{log}");

    pool.signal(libc::SIGINT);
    assert_eq!(pool.wait_for_exit().code(), Some(0));
}
