use super::process::{terminate_tree, tree_memory_bytes};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Memory ceiling watchdog for one native process tree
///
/// Runs on its own named thread, polling the tree's virtual memory every
/// `period`. Crossing the ceiling terminates the tree and ends polling.
/// The verdict is only observable through `finish()`, which joins the
/// thread, so no poller outlives the run that started it.
pub struct MemoryMonitor {
    pid: i32,
    stop: Sender<()>,
    handle: JoinHandle<bool>,
}

impl MemoryMonitor {
    pub fn spawn(pid: i32, limit_bytes: u64, period: Duration, grace: Duration) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(format!("mempoll-{}", pid))
            .spawn(move || {
                loop {
                    let used = tree_memory_bytes(pid);
                    if used > limit_bytes {
                        warn!(
                            pid,
                            used_mib = used >> 20,
                            limit_mib = limit_bytes >> 20,
                            "Memory limit exceeded, terminating process tree"
                        );
                        terminate_tree(pid, grace);
                        return true;
                    }
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return false,
                    }
                }
            })?;
        debug!(pid, limit_mib = limit_bytes >> 20, period_ms = period.as_millis() as u64, "Memory monitor started");
        Ok(Self { pid, stop, handle })
    }

    /// Stop polling and wait for the thread; `true` if the ceiling was hit
    ///
    /// Blocks, so async callers go through `spawn_blocking`.
    pub fn finish(self) -> bool {
        // A send error only means the poller already returned
        let _ = self.stop.send(());
        match self.handle.join() {
            Ok(out_of_memory) => {
                debug!(pid = self.pid, out_of_memory, "Memory monitor joined");
                out_of_memory
            }
            Err(_) => {
                error!(pid = self.pid, "Memory monitor thread panicked");
                false
            }
        }
    }
}
