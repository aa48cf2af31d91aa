//! Child-process setup applied between `fork()` and `execve()`.
//!
//! Every process the simulator spawns (the supervisor process and each
//! client worker) becomes the leader of a new session, so the whole tree can
//! later be signalled through its process group. On non-Unix platforms the
//! request is logged and ignored.
use tokio::process::Command;
#[cfg(not(unix))]
use tracing::warn;

/// Spawn-time settings for a child process.
#[derive(Debug, Clone, Default)]
pub struct SpawnLimits {
    /// Start the child in its own session and process group.
    pub new_process_group: bool,
}

impl SpawnLimits {
    /// Own session and process group.
    pub fn detached() -> Self {
        Self {
            new_process_group: true,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.new_process_group
    }
}

/// Install the `pre_exec` hook for `limits` on `cmd`.
pub fn attach_limits(cmd: &mut Command, limits: &SpawnLimits) {
    if limits.is_empty() {
        return;
    }

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(not(unix))]
    {
        let _ = cmd;
        warn!(
            target: "flsim.exec.limits",
            ?limits,
            "process groups are not supported on this OS; ignored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_noop() {
        assert!(SpawnLimits::default().is_empty());
        assert!(!SpawnLimits::detached().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_child_leads_its_own_group() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        attach_limits(&mut cmd, &SpawnLimits::detached());

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
        assert_eq!(pgid, pid as libc::pid_t);

        child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn default_child_stays_in_our_group() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        attach_limits(&mut cmd, &SpawnLimits::default());

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
        assert_eq!(pgid, unsafe { libc::getpgid(0) });

        child.kill().await.unwrap();
    }
}
