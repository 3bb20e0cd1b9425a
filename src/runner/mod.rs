//! The command runner: spawns one child process per edge and reports
//! completion back to the single-threaded builder loop over a channel.
//! Deliberately not async — one OS thread blocks on each child's
//! `wait`/`output`, which keeps the builder's own state untouched by
//! anything but its own loop.

pub mod jobserver;

use std::io::Write as _;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use crate::error::RunError;
use crate::graph::EdgeId;
use crate::runner::jobserver::{Jobserver, Slot};

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
}

#[derive(Debug)]
pub struct FinishedTask {
    pub edge: EdgeId,
    pub result: TaskResult,
}

/// A response file the runner writes before spawning and removes after a
/// successful run (kept on failure so it can be inspected).
#[derive(Debug, Clone)]
pub struct RspFileSpec {
    pub path: PathBuf,
    pub content: String,
}

/// Everything the builder hands the runner to execute one edge.
pub struct Task {
    pub edge: EdgeId,
    pub command: String,
    pub rspfile: Option<RspFileSpec>,
    /// Edges in the `console` pool inherit stdio instead of having their
    /// output captured.
    pub use_console: bool,
}

/// The three operations the builder drives the runner with.
pub trait CommandRunner {
    fn start(&mut self, task: Task) -> Result<(), RunError>;
    /// Whether the runner has a slot free for another concurrent child.
    /// Takes `&mut self` because an implementation backed by a jobserver may
    /// need to attempt (and hold onto) a token acquisition to answer.
    fn can_start_more(&mut self) -> bool;
    fn is_running(&self) -> bool;
    /// Blocks until at least one child has finished or the process has been
    /// asked to shut down.
    fn wait_for_any(&mut self) -> Result<(), RunError>;
    fn next_finished(&mut self) -> Option<FinishedTask>;
}

fn run_child(command: &str, use_console: bool) -> TaskResult {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }

    if use_console {
        cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        return match cmd.status() {
            Ok(status) => TaskResult { success: status.success(), output: String::new() },
            Err(e) => TaskResult { success: false, output: e.to_string() },
        };
    }

    match cmd.output() {
        Ok(out) => {
            let mut bytes = out.stdout;
            bytes.extend_from_slice(&out.stderr);
            let mut success = out.status.success();
            if let Some(sig) = out.status.signal() {
                success = false;
                let _ = write!(bytes, "\nterminated by signal {sig}");
            }
            TaskResult { success, output: String::from_utf8_lossy(&bytes).into_owned() }
        }
        Err(e) => TaskResult { success: false, output: e.to_string() },
    }
}

fn prepare_rspfile(spec: &RspFileSpec) -> std::io::Result<()> {
    if let Some(parent) = spec.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&spec.path, &spec.content)
}

/// Thread-per-task runner: each in-flight child gets its own `std::thread`
/// blocking on `Command::output`/`status`, reporting back over an `mpsc`
/// channel to the single builder loop.
pub struct PosixCommandRunner {
    parallelism: usize,
    running: usize,
    tx: mpsc::Sender<FinishedTask>,
    rx: mpsc::Receiver<FinishedTask>,
    pending: std::collections::VecDeque<FinishedTask>,
    cancelled: Arc<AtomicBool>,
    jobserver: Jobserver,
    /// A token already pulled out of the jobserver by `can_start_more`,
    /// waiting to be handed to the next `start`.
    pending_slot: Option<Slot>,
}

impl PosixCommandRunner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            parallelism: parallelism.max(1),
            running: 0,
            tx,
            rx,
            pending: std::collections::VecDeque::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            jobserver: Jobserver::from_env(),
            pending_slot: None,
        }
    }

    /// A handle the signal-handling driver code can flip to stop accepting
    /// new starts; in-flight children are left to the builder to reap.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl CommandRunner for PosixCommandRunner {
    fn start(&mut self, task: Task) -> Result<(), RunError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(RunError::Interrupted);
        }
        if let Some(rsp) = &task.rspfile {
            prepare_rspfile(rsp).map_err(RunError::Spawn)?;
        }

        // The first concurrent child runs on the implicit slot every
        // process gets by jobserver convention; anything beyond that holds
        // a real token for the lifetime of the child.
        let slot = if self.running == 0 {
            None
        } else {
            self.pending_slot.take().or_else(|| self.jobserver.try_acquire())
        };

        let tx = self.tx.clone();
        let edge = task.edge;
        let command = task.command;
        let rspfile = task.rspfile;
        let use_console = task.use_console;
        thread::spawn(move || {
            let result = run_child(&command, use_console);
            if let Some(rsp) = &rspfile {
                if result.success {
                    let _ = std::fs::remove_file(&rsp.path);
                }
            }
            let _ = tx.send(FinishedTask { edge, result });
            drop(slot);
        });
        self.running += 1;
        Ok(())
    }

    fn can_start_more(&mut self) -> bool {
        if self.running >= self.parallelism {
            return false;
        }
        if self.running == 0 || !self.jobserver.is_active() {
            return true;
        }
        if self.pending_slot.is_some() {
            return true;
        }
        match self.jobserver.try_acquire() {
            Some(slot) => {
                self.pending_slot = Some(slot);
                true
            }
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.running > 0
    }

    fn wait_for_any(&mut self) -> Result<(), RunError> {
        match self.rx.recv() {
            Ok(finished) => {
                self.running -= 1;
                self.pending.push_back(finished);
                Ok(())
            }
            Err(_) => Err(RunError::Jobserver("runner channel closed unexpectedly".to_string())),
        }
    }

    fn next_finished(&mut self) -> Option<FinishedTask> {
        if let Some(t) = self.pending.pop_front() {
            return Some(t);
        }
        match self.rx.try_recv() {
            Ok(t) => {
                self.running -= 1;
                Some(t)
            }
            Err(_) => None,
        }
    }
}

/// A scripted test double: results are supplied up front, `start` resolves
/// them immediately rather than spawning anything.
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    pub struct ScriptedRunner {
        scripts: HashMap<EdgeId, TaskResult>,
        finished: VecDeque<FinishedTask>,
        running: usize,
        parallelism: usize,
    }

    impl ScriptedRunner {
        pub fn new(parallelism: usize, scripts: HashMap<EdgeId, TaskResult>) -> Self {
            Self { scripts, finished: VecDeque::new(), running: 0, parallelism }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn start(&mut self, task: Task) -> Result<(), RunError> {
            let result = self.scripts.remove(&task.edge).unwrap_or(TaskResult { success: true, output: String::new() });
            self.running += 1;
            self.finished.push_back(FinishedTask { edge: task.edge, result });
            Ok(())
        }

        fn can_start_more(&mut self) -> bool {
            self.running < self.parallelism
        }

        fn is_running(&self) -> bool {
            self.running > 0
        }

        fn wait_for_any(&mut self) -> Result<(), RunError> {
            Ok(())
        }

        fn next_finished(&mut self) -> Option<FinishedTask> {
            let t = self.finished.pop_front()?;
            self.running -= 1;
            Some(t)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_trivial_command_successfully() {
        let mut runner = PosixCommandRunner::new(2);
        runner.start(Task { edge: EdgeId(0), command: "exit 0".to_string(), rspfile: None, use_console: false }).unwrap();
        runner.wait_for_any().unwrap();
        let finished = runner.next_finished().unwrap();
        assert_eq!(finished.edge, EdgeId(0));
        assert!(finished.result.success);
    }

    #[test]
    fn captures_merged_stdout_and_exit_failure() {
        let mut runner = PosixCommandRunner::new(1);
        runner
            .start(Task { edge: EdgeId(1), command: "echo hi; exit 3".to_string(), rspfile: None, use_console: false })
            .unwrap();
        runner.wait_for_any().unwrap();
        let finished = runner.next_finished().unwrap();
        assert!(!finished.result.success);
        assert!(finished.result.output.contains("hi"));
    }

    #[test]
    fn rspfile_is_written_before_and_removed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("args.rsp");
        let mut runner = PosixCommandRunner::new(1);
        runner
            .start(Task {
                edge: EdgeId(2),
                command: format!("test -f {}", path.display()),
                rspfile: Some(RspFileSpec { path: path.clone(), content: "-c -o out".to_string() }),
                use_console: false,
            })
            .unwrap();
        runner.wait_for_any().unwrap();
        let finished = runner.next_finished().unwrap();
        assert!(finished.result.success);
        assert!(!path.exists());
    }

    #[test]
    fn parallelism_limit_is_respected() {
        let mut runner = PosixCommandRunner::new(2);
        assert!(runner.can_start_more());
    }
}
