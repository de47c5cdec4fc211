//! Background and stopped-job bookkeeping: asynchronous child reaping,
//! foreground waiting and the `fg`/`bg` transitions, including controlling-
//! terminal handoff.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgrp, tcsetpgrp, Pid};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: u32,
    pub pgid: Pid,
    /// Members not yet observed to have exited. The job is removed when the
    /// last one goes.
    pub pids: Vec<Pid>,
    pub cmdline: String,
    pub state: JobState,
}

/// Raised by the SIGCHLD handler, drained by the main loop. The handler does
/// nothing else; all table mutation and printing happens outside the
/// interruption context.
static CHILD_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: libc::c_int) {
    CHILD_PENDING.store(true, Ordering::Relaxed);
}

/// Installs the SIGCHLD handler. Called once at shell startup.
pub fn install_sigchld_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map(drop)
}

/// What a foreground wait observed: the translated status of the last
/// process to complete, whether the group was stopped instead of finishing,
/// and the members still alive at that point.
pub struct WaitOutcome {
    pub status: i32,
    pub stopped: bool,
    pub remaining: Vec<Pid>,
}

/// Blocks until every member of `pgid` has exited or the group stops. Waits
/// on the negated group id so only this pipeline's children are collected.
pub fn wait_group(pgid: Pid, mut pids: Vec<Pid>) -> WaitOutcome {
    let group = Pid::from_raw(-pgid.as_raw());
    let mut status = 0;

    loop {
        let observed = match waitpid(group, Some(WaitPidFlag::WUNTRACED)) {
            Ok(observed) => observed,
            Err(Errno::EINTR) => continue,
            // ECHILD: everything already collected.
            Err(_) => return WaitOutcome { status, stopped: false, remaining: pids },
        };
        match observed {
            WaitStatus::Exited(pid, code) => {
                status = code;
                pids.retain(|p| *p != pid);
            }
            WaitStatus::Signaled(pid, sig, _) => {
                status = 128 + sig as i32;
                pids.retain(|p| *p != pid);
            }
            WaitStatus::Stopped(..) => {
                return WaitOutcome { status, stopped: true, remaining: pids };
            }
            _ => {}
        }
        if pids.is_empty() {
            return WaitOutcome { status, stopped: false, remaining: pids };
        }
    }
}

/// The shell-wide registry of background and stopped process groups.
#[derive(Debug)]
pub struct JobTable {
    jobs: BTreeMap<u32, Job>,
    next_id: u32,
    shell_pgid: Pid,
}

impl JobTable {
    pub fn new() -> JobTable {
        JobTable {
            jobs: BTreeMap::new(),
            next_id: 1,
            shell_pgid: getpgrp(),
        }
    }

    pub fn shell_pgid(&self) -> Pid {
        self.shell_pgid
    }

    /// Registers a running background job and returns its id. Ids grow
    /// monotonically and are never reused.
    pub fn add(&mut self, pgid: Pid, pids: Vec<Pid>, cmdline: String) -> u32 {
        self.insert(pgid, pids, cmdline, JobState::Running)
    }

    /// Registers a foreground pipeline that was stopped before completing.
    pub fn add_stopped(&mut self, pgid: Pid, pids: Vec<Pid>, cmdline: String) -> u32 {
        self.insert(pgid, pids, cmdline, JobState::Stopped)
    }

    fn insert(&mut self, pgid: Pid, pids: Vec<Pid>, cmdline: String, state: JobState) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(id, %pgid, cmd = %cmdline, ?state, "job registered");
        self.jobs.insert(id, Job { id, pgid, pids, cmdline, state });
        id
    }

    /// True once since the last child-state-change notification. The caller
    /// follows up with [`reap`](JobTable::reap).
    pub fn take_pending(&self) -> bool {
        CHILD_PENDING.swap(false, Ordering::Relaxed)
    }

    /// Non-blockingly collects every pending child state change and folds it
    /// into the table. Events for pids the table does not know are ignored;
    /// the job either was reaped by a foreground wait or is not yet
    /// registered, in which case the state converges on the next pass.
    pub fn reap(&mut self) {
        let any = Pid::from_raw(-1);
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(any, Some(flags)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => self.update(status),
            }
        }
    }

    fn update(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                if let Some(id) = self.find_by_pid(pid) {
                    let done = {
                        let job = self.jobs.get_mut(&id).unwrap();
                        job.pids.retain(|p| *p != pid);
                        job.pids.is_empty()
                    };
                    if done {
                        debug!(id, "job finished");
                        self.jobs.remove(&id);
                    }
                }
            }
            WaitStatus::Stopped(pid, _) => {
                if let Some(id) = self.find_by_pid(pid) {
                    self.jobs.get_mut(&id).unwrap().state = JobState::Stopped;
                }
            }
            WaitStatus::Continued(pid) => {
                if let Some(id) = self.find_by_pid(pid) {
                    self.jobs.get_mut(&id).unwrap().state = JobState::Running;
                }
            }
            _ => {}
        }
    }

    fn find_by_pid(&self, pid: Pid) -> Option<u32> {
        self.jobs
            .values()
            .find(|j| j.pids.contains(&pid))
            .map(|j| j.id)
    }

    /// Writes the job list in insertion order. Side-effect free on the table.
    pub fn list(&self, mut out: impl io::Write) -> io::Result<()> {
        if self.jobs.is_empty() {
            return writeln!(out, "No background jobs.");
        }
        for job in self.jobs.values() {
            writeln!(
                out,
                "[{}] {}  {}  {}",
                job.id,
                job.pgid,
                job.state.as_str(),
                job.cmdline
            )?;
        }
        Ok(())
    }

    /// Brings a job to the foreground: terminal to the job's group, SIGCONT
    /// to the whole group, then a stoppable wait. The terminal always comes
    /// back to the shell, and a fully exited job leaves the table.
    pub fn fg(&mut self, id: u32) -> Result<i32, JobError> {
        let (pgid, pids) = {
            let job = self.jobs.get(&id).ok_or(JobError::NotFound)?;
            (job.pgid, job.pids.clone())
        };

        let _ = tcsetpgrp(io::stdin(), pgid);
        let _ = killpg(pgid, Signal::SIGCONT);
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = JobState::Running;
        }

        let outcome = wait_group(pgid, pids);
        let _ = tcsetpgrp(io::stdin(), self.shell_pgid);

        if outcome.stopped {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Stopped;
                job.pids = outcome.remaining;
            }
        } else {
            debug!(id, "foreground job finished");
            self.jobs.remove(&id);
        }
        Ok(outcome.status)
    }

    /// Resumes a job in the background without touching the terminal.
    pub fn bg(&mut self, id: u32) -> Result<(), JobError> {
        let job = self.jobs.get_mut(&id).ok_or(JobError::NotFound)?;
        let _ = killpg(job.pgid, Signal::SIGCONT);
        job.state = JobState::Running;
        println!("[{}] {} continued in background", job.id, job.pgid);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> JobTable {
        JobTable {
            jobs: BTreeMap::new(),
            next_id: 1,
            shell_pgid: Pid::from_raw(1),
        }
    }

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut t = table();
        let a = t.add(pid(100), vec![pid(100)], "a".into());
        let b = t.add(pid(200), vec![pid(200)], "b".into());
        t.update(WaitStatus::Exited(pid(100), 0));
        let c = t.add(pid(300), vec![pid(300)], "c".into());
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn job_is_removed_when_last_member_exits() {
        let mut t = table();
        t.add(pid(500), vec![pid(500), pid(501)], "a | b".into());
        t.update(WaitStatus::Exited(pid(501), 0));
        assert!(!t.is_empty());
        t.update(WaitStatus::Exited(pid(500), 0));
        assert!(t.is_empty());
    }

    #[test]
    fn fatal_signal_also_removes() {
        let mut t = table();
        t.add(pid(500), vec![pid(500)], "x".into());
        t.update(WaitStatus::Signaled(pid(500), Signal::SIGKILL, false));
        assert!(t.is_empty());
    }

    #[test]
    fn stop_and_continue_flip_state() {
        let mut t = table();
        let id = t.add(pid(500), vec![pid(500)], "x".into());
        t.update(WaitStatus::Stopped(pid(500), Signal::SIGTSTP));
        assert_eq!(t.jobs[&id].state, JobState::Stopped);
        t.update(WaitStatus::Continued(pid(500)));
        assert_eq!(t.jobs[&id].state, JobState::Running);
    }

    #[test]
    fn unknown_pid_is_ignored() {
        let mut t = table();
        t.add(pid(500), vec![pid(500)], "x".into());
        t.update(WaitStatus::Exited(pid(999), 0));
        t.update(WaitStatus::Stopped(pid(999), Signal::SIGTSTP));
        assert_eq!(t.jobs.len(), 1);
        assert_eq!(t.jobs[&1].state, JobState::Running);
    }

    #[test]
    fn fg_on_unknown_id_leaves_table_unchanged() {
        let mut t = table();
        t.add(pid(500), vec![pid(500)], "x".into());
        assert!(matches!(t.fg(42), Err(JobError::NotFound)));
        assert_eq!(t.jobs.len(), 1);
    }

    #[test]
    fn bg_on_unknown_id_fails() {
        let mut t = table();
        assert!(matches!(t.bg(7), Err(JobError::NotFound)));
    }

    #[test]
    fn bg_marks_running_without_blocking() {
        let mut t = table();
        // A pgid that cannot exist keeps the SIGCONT from reaching anything.
        let id = t.add_stopped(pid(i32::MAX - 1), vec![pid(i32::MAX - 1)], "x".into());
        assert_eq!(t.jobs[&id].state, JobState::Stopped);
        t.bg(id).unwrap();
        assert_eq!(t.jobs[&id].state, JobState::Running);
    }

    #[test]
    fn list_formats_rows() {
        let mut t = table();
        t.add(pid(4242), vec![pid(4242)], "sleep 5".into());
        t.update(WaitStatus::Stopped(pid(4242), Signal::SIGTSTP));
        let mut buf = Vec::new();
        t.list(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "[1] 4242  stopped  sleep 5\n");
    }

    #[test]
    fn empty_list_prints_placeholder() {
        let t = table();
        let mut buf = Vec::new();
        t.list(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No background jobs.\n");
    }
}
