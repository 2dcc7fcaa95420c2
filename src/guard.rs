/// Lifecycle guard for the active worker process group.
///
/// The supervisor owns the worker. This module only remembers which process
/// group is live so it can be terminated if the supervisor leaves early: a
/// dropped guard, an unwinding panic, or SIGINT/SIGTERM delivered to the
/// supervisor itself.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tokio::task::JoinHandle;

/// Shared record of the process group currently under supervision.
#[derive(Debug, Clone, Default)]
pub struct ActiveGroup {
    pgid: Arc<Mutex<Option<i32>>>,
}

impl ActiveGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered process group id, if a worker is live.
    pub fn current(&self) -> Option<i32> {
        *self.pgid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, pgid: Option<i32>) {
        *self.pgid.lock().unwrap_or_else(|e| e.into_inner()) = pgid;
    }

    /// Signal and unregister the active group. Returns the group that was
    /// signaled, if any.
    pub fn kill_active(&self, sig: Signal) -> Option<i32> {
        let pgid = self.pgid.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        tracing::warn!(pgid, signal = %sig, "terminating active worker process group");
        signal_group(pgid, sig);
        Some(pgid)
    }
}

/// Scoped registration of one worker process group.
///
/// Acquired right after spawn. Disarm it once the worker has been observed
/// to exit; dropping it while still armed terminates the group.
#[derive(Debug)]
pub struct GroupGuard {
    active: ActiveGroup,
    pgid: i32,
    armed: bool,
}

impl GroupGuard {
    pub fn acquire(active: &ActiveGroup, pgid: i32) -> Self {
        active.set(Some(pgid));
        tracing::debug!(pgid, "process group registered");
        Self {
            active: active.clone(),
            pgid,
            armed: true,
        }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// The group has exited; nothing left to clean up.
    pub fn disarm(&mut self) {
        if self.armed {
            self.armed = false;
            self.active.set(None);
            tracing::debug!(pgid = self.pgid, "process group released");
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(pgid = self.pgid, "guard dropped with live worker");
            self.active.kill_active(Signal::SIGTERM);
            self.armed = false;
        }
    }
}

/// Send `sig` to every process in group `pgid`.
///
/// A group that no longer exists is not an error. Returns whether the
/// signal was delivered.
pub fn signal_group(pgid: i32, sig: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => {
            tracing::info!(pgid, signal = %sig, "signaled process group");
            true
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pgid, "process group already gone");
            false
        }
        Err(e) => {
            tracing::warn!(pgid, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Watch for SIGINT/SIGTERM aimed at the supervisor. On receipt, terminate
/// the active worker group and exit with the conventional status.
pub fn install_signal_handler(active: ActiveGroup) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(i), Ok(t)) => (i, t),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "failed to install signal handlers");
                    return;
                }
            };

        let code = shutdown_on_signal(&active, &mut sigint, &mut sigterm).await;
        std::process::exit(code);
    })
}

/// Wait for SIGINT or SIGTERM, then terminate the active group. Returns the
/// exit status the supervisor should leave with.
async fn shutdown_on_signal(
    active: &ActiveGroup,
    sigint: &mut SignalStream,
    sigterm: &mut SignalStream,
) -> i32 {
    let code = tokio::select! {
        _ = sigint.recv() => 130,
        _ = sigterm.recv() => 143,
    };
    tracing::warn!(code, "supervisor interrupted, shutting down");
    active.kill_active(Signal::SIGTERM);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Command;

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_guard_registers_and_disarm_clears() {
        let active = ActiveGroup::new();
        assert_eq!(active.current(), None);

        let mut guard = GroupGuard::acquire(&active, 4242);
        assert_eq!(active.current(), Some(4242));
        assert_eq!(guard.pgid(), 4242);

        guard.disarm();
        assert_eq!(active.current(), None);
        drop(guard);
        assert_eq!(active.current(), None);
    }

    #[test]
    fn test_dropping_armed_guard_kills_group() {
        let active = ActiveGroup::new();
        let mut child = spawn_sleeper();
        let pgid = child.id() as i32;

        let guard = GroupGuard::acquire(&active, pgid);
        drop(guard);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert_eq!(active.current(), None);
    }

    #[test]
    fn test_disarmed_guard_does_not_signal() {
        let active = ActiveGroup::new();
        let mut child = spawn_sleeper();
        let pgid = child.id() as i32;

        let mut guard = GroupGuard::acquire(&active, pgid);
        guard.disarm();
        drop(guard);

        assert!(child.try_wait().unwrap().is_none(), "sleeper should still run");
        signal_group(pgid, Signal::SIGKILL);
        child.wait().unwrap();
    }

    #[test]
    fn test_signal_exited_group_is_tolerated() {
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let pgid = child.id() as i32;
        child.wait().unwrap();

        assert!(!signal_group(pgid, Signal::SIGTERM));
    }

    #[test]
    fn test_kill_active_without_group_is_noop() {
        let active = ActiveGroup::new();
        assert_eq!(active.kill_active(Signal::SIGTERM), None);
    }

    #[tokio::test]
    async fn test_sigterm_terminates_registered_group() {
        let active = ActiveGroup::new();
        let mut child = spawn_sleeper();
        let guard = GroupGuard::acquire(&active, child.id() as i32);

        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();

        let code = shutdown_on_signal(&active, &mut sigint, &mut sigterm).await;
        assert_eq!(code, 143);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert_eq!(active.current(), None);
        drop(guard);
    }
}
