use std::{io, net::TcpListener};

use tracing::{debug, trace};

/// Reserve a free loopback port.
///
/// The listener is dropped before returning, so another process may grab the
/// port before the worker binds it.
pub fn open_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Returns `true` while `pid` exists and has not exited. A zombie waiting
/// to be reaped counts as dead.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    let exists = rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    stat_fields(pid).is_some_and(|fields| fields.first().map(String::as_str) == Some("Z"))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// SIGKILL the process group led by `pgid`. A group that is already gone is not an error.
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        trace!(target: "flsim.exec.util", pgid, "process group already gone");
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> io::Result<()> {
    Ok(())
}

/// SIGKILL `pid`, its process group and every descendant found in `/proc`.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    let mut victims = descendants(pid);
    victims.push(pid);
    debug!(target: "flsim.exec.util", pid, count = victims.len(), "killing process tree");

    let _ = kill_group(pid);
    for victim in victims {
        unsafe {
            libc::kill(victim as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) {}

/// Every transitive child of `root`, deepest last.
#[cfg(target_os = "linux")]
fn descendants(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let parents: Vec<(u32, u32)> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| Some((pid, parent_of(pid)?)))
        .collect();

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in &parents {
            if ppid == parent && !found.contains(&pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }
    found
}

#[cfg(all(unix, not(target_os = "linux")))]
fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

/// Fields of `/proc/<pid>/stat` after the command name, starting with the
/// state. The command name may contain spaces, so splitting starts after its
/// closing paren.
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
    stat_fields(pid)?.get(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_port_returns_bindable_port() {
        let port = open_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn killed_but_unreaped_child_is_dead() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(process_alive(pid));

        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while process_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!process_alive(pid));
        child.wait().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_spawned_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let me = std::process::id();
        assert!(descendants(me).contains(&child.id()));
        assert_eq!(parent_of(child.id()), Some(me));

        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGKILL);
        }
        child.wait().unwrap();
    }
}
