//! Thin layer over the host kernel: forking, signaling pids, reaping dead
//! children, and buffering asynchronously delivered signals.
//!
//! The signal queue and the installed handlers are process-global (the
//! kernel allows one handler per signal), so only one [`Posix`] may exist
//! per process; [`Posix::new`] enforces that. The supervisor talks to the
//! kernel through the [`Platform`] trait so tests can substitute a
//! recording fake.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use tracing::warn;

pub type Pid = libc::pid_t;

/// Platform-independent identifiers for the signals the pool deals in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sig {
    Quit,
    Int,
    Term,
    Usr1,
    Usr2,
    Cont,
    Hup,
    Winch,
    Chld,
}

impl Sig {
    pub fn as_raw(self) -> i32 {
        match self {
            Sig::Quit => libc::SIGQUIT,
            Sig::Int => libc::SIGINT,
            Sig::Term => libc::SIGTERM,
            Sig::Usr1 => libc::SIGUSR1,
            Sig::Usr2 => libc::SIGUSR2,
            Sig::Cont => libc::SIGCONT,
            Sig::Hup => libc::SIGHUP,
            Sig::Winch => libc::SIGWINCH,
            Sig::Chld => libc::SIGCHLD,
        }
    }

    pub fn from_raw(signum: i32) -> Option<Sig> {
        match signum {
            n if n == libc::SIGQUIT => Some(Sig::Quit),
            n if n == libc::SIGINT => Some(Sig::Int),
            n if n == libc::SIGTERM => Some(Sig::Term),
            n if n == libc::SIGUSR1 => Some(Sig::Usr1),
            n if n == libc::SIGUSR2 => Some(Sig::Usr2),
            n if n == libc::SIGCONT => Some(Sig::Cont),
            n if n == libc::SIGHUP => Some(Sig::Hup),
            n if n == libc::SIGWINCH => Some(Sig::Winch),
            n if n == libc::SIGCHLD => Some(Sig::Chld),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Sig::Quit => "QUIT",
            Sig::Int => "INT",
            Sig::Term => "TERM",
            Sig::Usr1 => "USR1",
            Sig::Usr2 => "USR2",
            Sig::Cont => "CONT",
            Sig::Hup => "HUP",
            Sig::Winch => "WINCH",
            Sig::Chld => "CHLD",
        }
    }

    fn to_nix(self) -> Signal {
        match self {
            Sig::Quit => Signal::SIGQUIT,
            Sig::Int => Signal::SIGINT,
            Sig::Term => Signal::SIGTERM,
            Sig::Usr1 => Signal::SIGUSR1,
            Sig::Usr2 => Signal::SIGUSR2,
            Sig::Cont => Signal::SIGCONT,
            Sig::Hup => Signal::SIGHUP,
            Sig::Winch => Signal::SIGWINCH,
            Sig::Chld => Signal::SIGCHLD,
        }
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent(Pid),
    Child,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exit {code}"),
            ChildStatus::Signaled(signum) => write!(f, "signal {signum}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: ChildStatus,
}

/// Everything the supervisor needs from the operating system.
pub trait Platform {
    /// Register the asynchronous handler for each signal in `signals`.
    /// Delivered signals are buffered until drained with [`next_signal`].
    ///
    /// [`next_signal`]: Platform::next_signal
    fn install_signal_trap(&mut self, signals: &[Sig]) -> Result<()>;

    /// Oldest buffered signal, or `None` when the queue is empty.
    fn next_signal(&mut self) -> Option<Sig>;

    /// Number of buffered signals not yet drained.
    fn pending_signals(&self) -> usize;

    /// Suspend for up to `duration`, returning early when any signal is
    /// delivered.
    fn sleep(&mut self, duration: Duration);

    fn fork(&mut self) -> Result<Forked>;

    /// Deliver `sig` to each pid. Pids that no longer exist are skipped:
    /// racing against reaping is expected.
    fn signal_pids(&mut self, pids: &[Pid], sig: Sig);

    /// Next child that has exited. With `wait` false this is a
    /// non-blocking poll; with `wait` true it blocks until a child exits,
    /// returning them one at a time, and yields `None` once no children
    /// remain.
    fn next_dead_child(&mut self, wait: bool) -> Option<ChildExit>;

    /// Restore default dispositions for every trapped signal. Called in
    /// the child immediately after fork.
    fn release_signals(&mut self);

    fn set_quit_on_exit_signal(&mut self, flag: bool);

    fn quit_on_exit_signal(&self) -> bool;
}

const QUEUE_CAPACITY: usize = 64;

/// Fixed-capacity signal queue. Handler executions never nest (every
/// trapped signal's `sa_mask` covers the whole trapped set), so there is a
/// single producer and a single consumer and plain acquire/release atomics
/// suffice.
struct SignalRing {
    slots: [AtomicI32; QUEUE_CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl SignalRing {
    const fn new() -> SignalRing {
        SignalRing {
            slots: [const { AtomicI32::new(0) }; QUEUE_CAPACITY],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side; async-signal-safe. A full ring drops the signal:
    /// repeat delivery within one tick is idempotent for every handler.
    fn push(&self, signum: i32) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(self.head.load(Ordering::Acquire)) >= QUEUE_CAPACITY {
            return;
        }
        self.slots[tail % QUEUE_CAPACITY].store(signum, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    fn pop(&self) -> Option<i32> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let signum = self.slots[head % QUEUE_CAPACITY].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(signum)
    }

    fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }
}

static QUEUE: SignalRing = SignalRing::new();

extern "C" fn enqueue_signal(signum: libc::c_int) {
    QUEUE.push(signum);
}

static CLAIMED: AtomicBool = AtomicBool::new(false);

/// The real platform. At most one per process.
pub struct Posix {
    installed: Vec<Sig>,
    quit_on_exit: bool,
}

impl Posix {
    pub fn new() -> Result<Posix> {
        if CLAIMED.swap(true, Ordering::SeqCst) {
            bail!("platform already initialized in this process");
        }
        Ok(Posix {
            installed: Vec::new(),
            quit_on_exit: false,
        })
    }
}

impl Platform for Posix {
    fn install_signal_trap(&mut self, signals: &[Sig]) -> Result<()> {
        // Mask the whole trapped set during handler execution so enqueues
        // never nest.
        let mut mask = SigSet::empty();
        for sig in signals {
            mask.add(sig.to_nix());
        }
        let action = SigAction::new(SigHandler::Handler(enqueue_signal), SaFlags::empty(), mask);
        for sig in signals {
            // SAFETY: the handler only touches the atomic signal ring.
            unsafe { signal::sigaction(sig.to_nix(), &action) }
                .with_context(|| format!("install handler for SIG{sig}"))?;
            self.installed.push(*sig);
        }
        Ok(())
    }

    fn next_signal(&mut self) -> Option<Sig> {
        while let Some(signum) = QUEUE.pop() {
            if let Some(sig) = Sig::from_raw(signum) {
                return Some(sig);
            }
        }
        None
    }

    fn pending_signals(&self) -> usize {
        QUEUE.len()
    }

    fn sleep(&mut self, duration: Duration) {
        let request = libc::timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };
        // SAFETY: nanosleep only reads `request`; EINTR on signal delivery
        // is the early wakeup we want, so the remainder is discarded.
        unsafe { libc::nanosleep(&request, std::ptr::null_mut()) };
    }

    fn fork(&mut self) -> Result<Forked> {
        // SAFETY: the supervisor is single-threaded, and the child only
        // performs exec or _exit after straight-line setup.
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child }) => Ok(Forked::Parent(child.as_raw())),
            Ok(nix::unistd::ForkResult::Child) => Ok(Forked::Child),
            Err(err) => Err(err).context("fork failed"),
        }
    }

    fn signal_pids(&mut self, pids: &[Pid], sig: Sig) {
        for &pid in pids {
            match signal::kill(nix::unistd::Pid::from_raw(pid), sig.to_nix()) {
                Ok(()) => {}
                // Already gone; it will be (or was) reaped.
                Err(Errno::ESRCH) => {}
                Err(err) => warn!(pid, signal = %sig, %err, "failed to signal child"),
            }
        }
    }

    fn next_dead_child(&mut self, wait: bool) -> Option<ChildExit> {
        let flags = if wait {
            None
        } else {
            Some(WaitPidFlag::WNOHANG)
        };
        loop {
            match waitpid(nix::unistd::Pid::from_raw(-1), flags) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    return Some(ChildExit {
                        pid: pid.as_raw(),
                        status: ChildStatus::Exited(code),
                    });
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    return Some(ChildExit {
                        pid: pid.as_raw(),
                        status: ChildStatus::Signaled(sig as i32),
                    });
                }
                Ok(WaitStatus::StillAlive) => return None,
                // Stopped or continued: not an exit, keep looking.
                Ok(_) => continue,
                Err(Errno::EINTR) if wait => continue,
                Err(Errno::EINTR) | Err(Errno::ECHILD) => return None,
                Err(err) => {
                    warn!(%err, "waitpid failed");
                    return None;
                }
            }
        }
    }

    fn release_signals(&mut self) {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for sig in self.installed.drain(..) {
            // SAFETY: restores the default disposition.
            let _ = unsafe { signal::sigaction(sig.to_nix(), &action) };
        }
    }

    fn set_quit_on_exit_signal(&mut self, flag: bool) {
        self.quit_on_exit = flag;
    }

    fn quit_on_exit_signal(&self) -> bool {
        self.quit_on_exit
    }
}

/// Best-effort process title; silently a no-op where unsupported.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = std::ffi::CString::new(title) {
            // SAFETY: PR_SET_NAME reads a NUL-terminated string (the
            // kernel truncates to 15 bytes).
            unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0) };
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

/// Exit a forked child without running the parent's inherited exit
/// handlers or flushing its buffered state.
pub fn exit_child(code: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and does not return.
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo() {
        let ring = SignalRing::new();
        ring.push(libc::SIGHUP);
        ring.push(libc::SIGTERM);
        ring.push(libc::SIGQUIT);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(libc::SIGHUP));
        assert_eq!(ring.pop(), Some(libc::SIGTERM));
        assert_eq!(ring.pop(), Some(libc::SIGQUIT));
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn ring_drops_when_full() {
        let ring = SignalRing::new();
        for _ in 0..QUEUE_CAPACITY {
            ring.push(libc::SIGUSR1);
        }
        ring.push(libc::SIGUSR2);
        assert_eq!(ring.len(), QUEUE_CAPACITY);
        for _ in 0..QUEUE_CAPACITY {
            assert_eq!(ring.pop(), Some(libc::SIGUSR1));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_wraps_around() {
        let ring = SignalRing::new();
        for round in 0..3 {
            for _ in 0..QUEUE_CAPACITY {
                ring.push(libc::SIGCONT);
            }
            for _ in 0..QUEUE_CAPACITY {
                assert_eq!(ring.pop(), Some(libc::SIGCONT), "round {round}");
            }
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn sig_raw_round_trip() {
        for sig in [
            Sig::Quit,
            Sig::Int,
            Sig::Term,
            Sig::Usr1,
            Sig::Usr2,
            Sig::Cont,
            Sig::Hup,
            Sig::Winch,
            Sig::Chld,
        ] {
            assert_eq!(Sig::from_raw(sig.as_raw()), Some(sig));
        }
        assert_eq!(Sig::from_raw(0), None);
    }

    #[test]
    fn child_status_display() {
        assert_eq!(ChildStatus::Exited(0).to_string(), "exit 0");
        assert_eq!(ChildStatus::Signaled(9).to_string(), "signal 9");
    }
}
