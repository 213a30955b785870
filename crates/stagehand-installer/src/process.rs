use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::InstallerError;

struct TrackedChild {
    name: String,
    pid: u32,
    child: Child,
    started: Instant,
}

/// Background processes started with donotwait while tracking is enabled.
/// The phase engine drains the table at the end of each phase.
pub struct ProcessTracker {
    children: Mutex<Vec<TrackedChild>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_tracked(&self, mut command: Command, name: &str) -> Result<(), InstallerError> {
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let child = command.spawn().map_err(|source| InstallerError::Spawn {
            name: name.to_string(),
            source,
        })?;

        let pid = child.id();
        tracing::info!(name, pid, "started background process");
        self.children
            .lock()
            .expect("process tracker poisoned")
            .push(TrackedChild {
                name: name.to_string(),
                pid,
                child,
                started: Instant::now(),
            });
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.children.lock().expect("process tracker poisoned").len()
    }

    /// Fan-in barrier over every tracked child: one waiter per process
    /// signals completion on a channel; when the timeout fires first, the
    /// survivors are killed and reported. The table is cleared either way.
    pub fn wait_all(&self, timeout: Duration) -> Vec<InstallerError> {
        let children: Vec<TrackedChild> = {
            let mut guard = self.children.lock().expect("process tracker poisoned");
            guard.drain(..).collect()
        };
        if children.is_empty() {
            return Vec::new();
        }

        let total = children.len();
        tracing::info!(
            total,
            timeout_secs = timeout.as_secs(),
            "waiting for background processes"
        );

        let (done_tx, done_rx) = mpsc::channel();
        let mut roster: Vec<(String, u32)> = Vec::with_capacity(total);
        for (index, mut tracked) in children.into_iter().enumerate() {
            roster.push((tracked.name.clone(), tracked.pid));
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let result = tracked.child.wait();
                let runtime = tracked.started.elapsed();
                let _ = done_tx.send((index, tracked.name, runtime, result));
            });
        }
        drop(done_tx);

        let deadline = Instant::now() + timeout;
        let mut completed = vec![false; total];
        let mut errors = Vec::new();

        while completed.iter().any(|done| !done) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok((index, name, runtime, result)) => {
                    completed[index] = true;
                    match result {
                        Ok(status) if status.success() => {
                            tracing::info!(
                                name = name.as_str(),
                                runtime_secs = runtime.as_secs(),
                                "background process completed"
                            );
                        }
                        Ok(status) => {
                            tracing::error!(name = name.as_str(), %status, "background process failed");
                            errors.push(InstallerError::BackgroundFailed {
                                name,
                                detail: status.to_string(),
                            });
                        }
                        Err(err) => {
                            errors.push(InstallerError::BackgroundFailed {
                                name,
                                detail: err.to_string(),
                            });
                        }
                    }
                }
                Err(_) => {
                    let survivors: Vec<&(String, u32)> = roster
                        .iter()
                        .enumerate()
                        .filter(|(index, _)| !completed[*index])
                        .map(|(_, entry)| entry)
                        .collect();
                    for (name, pid) in &survivors {
                        tracing::error!(name = name.as_str(), pid, "killing timed-out background process");
                        let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
                    }
                    errors.push(InstallerError::BackgroundTimeout {
                        survivors: survivors.len(),
                    });
                    return errors;
                }
            }
        }

        errors
    }
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}
