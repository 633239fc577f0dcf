use super::ExecMode;
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{setpgid, Pid};
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Signals the worker may have touched; the check gets default dispositions back.
const RESET_SIGNALS: [Signal; 6] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGALRM,
    Signal::SIGUSR1,
];

/// Make the spawned shell its own process-group leader, optionally with a
/// clean signal state.
pub(crate) fn isolate_in_group(command: &mut Command, reset_signals: bool) {
    // SAFETY: only async-signal-safe calls (setpgid, sigaction, sigprocmask)
    // run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
            if !reset_signals {
                return Ok(());
            }
            for sig in RESET_SIGNALS {
                signal::signal(sig, SigHandler::SigDfl)?;
            }
            signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
            Ok(())
        });
    }
}

pub(crate) fn interrupt(pid: u32, mode: ExecMode) {
    send(pid, mode, Signal::SIGINT);
}

pub(crate) fn kill(pid: u32, mode: ExecMode) {
    send(pid, mode, Signal::SIGKILL);
}

fn send(pid: u32, mode: ExecMode, sig: Signal) {
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => trace!(pid, signal = sig.as_str(), mode = mode.as_str(), "signal sent"),
        Err(Errno::ESRCH) => debug!(pid, signal = sig.as_str(), "check already gone"),
        Err(err) => warn!(pid, signal = sig.as_str(), "failed to signal check: {}", err),
    }
}

/// Name of a signal number, e.g. `SIGKILL`.
pub(crate) fn signal_name(number: i32) -> String {
    Signal::try_from(number)
        .map(|sig| sig.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", number))
}
