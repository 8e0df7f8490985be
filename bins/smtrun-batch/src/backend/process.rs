use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use procfs::process::{all_processes, Process};
use procfs::{Current, Meminfo};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// `root` followed by every live descendant, parents before children
pub fn process_tree(root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    match all_processes() {
        Ok(processes) => {
            for process in processes.flatten() {
                if let Ok(stat) = process.stat() {
                    children.entry(stat.ppid).or_default().push(stat.pid);
                }
            }
        }
        Err(e) => warn!(pid = root, error = %e, "Failed to enumerate processes"),
    }

    let mut tree = vec![root];
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                tree.push(*kid);
                queue.push_back(*kid);
            }
        }
    }
    tree
}

/// Running and not a zombie
pub fn is_alive(pid: i32) -> bool {
    Process::new(pid)
        .and_then(|p| p.stat())
        .map(|stat| stat.state != 'Z')
        .unwrap_or(false)
}

/// Virtual memory summed over the whole tree rooted at `root`
pub fn tree_memory_bytes(root: i32) -> u64 {
    process_tree(root)
        .into_iter()
        .filter_map(|pid| Process::new(pid).and_then(|p| p.stat()).ok())
        .filter(|stat| stat.state != 'Z')
        .map(|stat| stat.vsize)
        .sum()
}

/// RAM plus swap of the host, in bytes
pub fn host_memory_bytes() -> u64 {
    match Meminfo::current() {
        Ok(meminfo) => meminfo.mem_total.saturating_add(meminfo.swap_total),
        Err(e) => {
            warn!(error = %e, "Failed to read host memory, assuming unlimited");
            u64::MAX
        }
    }
}

fn signal(pid: i32, sig: Signal) {
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = %sig, error = %e, "Failed to signal process"),
    }
}

fn signal_group(pgid: i32, sig: Option<Signal>) -> bool {
    match killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// Same escalation as `terminate_tree`, addressed to a whole process group
///
/// Reaches members whose leader already exited and was reaped. The group id
/// stays reserved while any member lives, so it cannot name a stranger.
pub fn terminate_group(pgid: i32, pause: Duration) {
    if !signal_group(pgid, Some(Signal::SIGTERM)) {
        return;
    }
    debug!(pgid, "Terminating process group");
    if !pause.is_zero() {
        std::thread::sleep(pause);
    }
    if signal_group(pgid, None) {
        signal_group(pgid, Some(Signal::SIGKILL));
    }
}

/// Terminate, optionally pause, then kill whatever survived
///
/// The tree is captured before the first signal so children re-parented
/// by the root's death are still reached. Blocks for up to `pause`.
pub fn terminate_tree(root: i32, pause: Duration) {
    let tree = process_tree(root);
    debug!(pid = root, members = tree.len(), "Terminating process tree");

    // Children first so the root cannot respawn them
    for pid in tree.iter().rev() {
        signal(*pid, Signal::SIGTERM);
    }

    let survivors: Vec<i32> = tree.iter().copied().filter(|pid| is_alive(*pid)).collect();
    if survivors.is_empty() {
        return;
    }
    if !pause.is_zero() {
        std::thread::sleep(pause);
    }
    for pid in survivors.iter().rev() {
        if is_alive(*pid) {
            debug!(pid, "Process survived SIGTERM, sending SIGKILL");
            signal(*pid, Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::Instant;

    fn wait_until_dead(pid: i32, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if !is_alive(pid) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_tree_contains_grandchildren() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let root = child.id() as i32;
        thread::sleep(Duration::from_millis(300));

        let tree = process_tree(root);
        assert_eq!(tree[0], root);
        assert!(tree.len() >= 3, "expected shell plus two sleeps, got {:?}", tree);
        assert!(tree_memory_bytes(root) > 0);

        terminate_tree(root, Duration::from_millis(100));
        child.wait().unwrap();
        for pid in &tree[1..] {
            assert!(wait_until_dead(*pid, Duration::from_secs(5)), "pid {} survived", pid);
        }
    }

    #[test]
    fn test_terminate_kills_term_ignoring_process() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while true; do sleep 0.1; done"])
            .spawn()
            .unwrap();
        let root = child.id() as i32;
        thread::sleep(Duration::from_millis(200));

        terminate_tree(root, Duration::from_millis(200));
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_group_reaches_orphaned_members() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(format!("sleep 30 & echo $! > {}; exit 0", pid_file.display()))
            .process_group(0);
        let mut child = command.spawn().unwrap();
        let leader = child.id() as i32;
        child.wait().unwrap();

        let orphan: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(is_alive(orphan));
        assert!(!is_alive(leader));

        terminate_group(leader, Duration::ZERO);
        assert!(wait_until_dead(orphan, Duration::from_secs(5)), "pid {} survived", orphan);
    }

    #[test]
    fn test_missing_process_is_not_alive() {
        assert!(!is_alive(i32::MAX));
        assert_eq!(process_tree(i32::MAX), vec![i32::MAX]);
        terminate_tree(i32::MAX, Duration::ZERO);
        terminate_group(i32::MAX, Duration::ZERO);
    }

    #[test]
    fn test_host_memory_is_positive() {
        assert!(host_memory_bytes() > 0);
    }
}
