//! Pipeline orchestration: pipe wiring, process-group assignment, exec and
//! foreground/background completion.

use std::ffi::{self, CString};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::raw::c_int;
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{self, dup2, execvp, fork, pipe, setpgid, tcsetpgrp, ForkResult, Pid};
use thiserror::Error;
use tracing::debug;

use crate::builtin;
use crate::global::State;
use crate::job;
use crate::types::{Pipeline, Stage};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("nul byte in argument: {0}")]
    Nul(#[from] ffi::NulError),
}

/// Signals the shell suppresses for itself but children must see with their
/// default dispositions.
const CHILD_DEFAULT_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGTSTP,
    Signal::SIGQUIT,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

fn apply_redirections(stage: &Stage) -> Result<(), ExecError> {
    if let Some(path) = &stage.redirect.input {
        let file = OpenOptions::new().read(true).open(path)?;
        let fd = file.into_raw_fd();
        dup2(fd, libc::STDIN_FILENO)?;
        unistd::close(fd)?;
    }
    if let Some(path) = &stage.redirect.output {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).mode(0o644);
        if stage.redirect.append {
            opts.append(true);
        } else {
            opts.truncate(true);
        }
        let file = opts.open(path)?;
        let fd = file.into_raw_fd();
        dup2(fd, libc::STDOUT_FILENO)?;
        unistd::close(fd)?;
    }
    Ok(())
}

/// Runs in the forked child; never returns. Joins the pipeline's process
/// group, restores signal defaults, claims the terminal for a foreground
/// pipeline, wires pipes and redirections, then replaces the process image.
fn exec_stage(
    stage: &Stage,
    stage_index: usize,
    pgid: Option<Pid>,
    foreground: bool,
    stdin_fd: Option<c_int>,
    stdout_fd: Option<c_int>,
    all_fds: &[(c_int, c_int)],
) -> ! {
    let zero = Pid::from_raw(0);
    let _ = setpgid(zero, pgid.unwrap_or(zero));
    // Claim the terminal while SIGTTOU is still inherited as ignored, then
    // restore the default dispositions the shell suppressed for itself.
    if foreground {
        let _ = tcsetpgrp(io::stdin(), unistd::getpgrp());
    }
    for sig in CHILD_DEFAULT_SIGNALS {
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }

    if let Some(fd) = stdin_fd {
        let _ = dup2(fd, libc::STDIN_FILENO);
    }
    if let Some(fd) = stdout_fd {
        let _ = dup2(fd, libc::STDOUT_FILENO);
    }
    for &(r, w) in all_fds {
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }

    if let Err(err) = apply_redirections(stage) {
        eprintln!("mish: redirection: {}", err);
        unsafe { libc::_exit(1) }
    }

    if stage.argv.is_empty() {
        unsafe { libc::_exit(0) }
    }

    let argv: Result<Vec<CString>, ffi::NulError> = stage
        .argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect();
    let argv = match argv {
        Ok(argv) => argv,
        Err(err) => {
            eprintln!("mish: stage {}: {}", stage_index, err);
            unsafe { libc::_exit(126) }
        }
    };

    // Only reached when the replacement fails: command missing or not
    // executable.
    let err = execvp(&argv[0], &argv).unwrap_err();
    eprintln!("mish: {}: {}", stage.argv[0], err);
    unsafe { libc::_exit(127) }
}

fn make_pipes(count: usize) -> Result<Vec<(c_int, c_int)>, ExecError> {
    let mut fds = Vec::with_capacity(count);
    for _ in 0..count {
        match pipe() {
            Ok((r, w)) => fds.push((r.into_raw_fd(), w.into_raw_fd())),
            Err(err) => {
                close_all(&fds);
                return Err(err.into());
            }
        }
    }
    Ok(fds)
}

fn close_all(fds: &[(c_int, c_int)]) {
    for &(r, w) in fds {
        let _ = unistd::close(r);
        let _ = unistd::close(w);
    }
}

fn spawn_stages(
    pipeline: &Pipeline,
    fds: &[(c_int, c_int)],
) -> Result<(Pid, Vec<Pid>), ExecError> {
    let n = pipeline.stages.len();
    let mut pgid: Option<Pid> = None;
    let mut pids = Vec::with_capacity(n);

    for (i, stage) in pipeline.stages.iter().enumerate() {
        let stdin_fd = (i > 0).then(|| fds[i - 1].0);
        let stdout_fd = (i + 1 < n).then(|| fds[i].1);

        match unsafe { fork() }? {
            ForkResult::Child => exec_stage(
                stage,
                i,
                pgid,
                !pipeline.is_background,
                stdin_fd,
                stdout_fd,
                fds,
            ),
            ForkResult::Parent { child } => {
                // Mirrored from the parent side as well, to close the race
                // between fork and the child's own group join.
                let group = *pgid.get_or_insert(child);
                let _ = setpgid(child, group);
                pids.push(child);
                debug!(pid = %child, stage = i, "stage forked");
            }
        }
    }

    Ok((pgid.expect("pipeline has at least one stage"), pids))
}

fn run_pipeline(state: &mut State, pipeline: &Pipeline) -> Result<i32, ExecError> {
    let fds = make_pipes(pipeline.stages.len().saturating_sub(1))?;

    let spawned = spawn_stages(pipeline, &fds);
    close_all(&fds);
    let (pgid, pids) = spawned?;

    if pipeline.is_background {
        let id = state.jobs.add(pgid, pids, pipeline.render());
        println!("[{}] {}", id, pgid);
        return Ok(0);
    }

    let _ = tcsetpgrp(io::stdin(), pgid);
    let outcome = job::wait_group(pgid, pids);
    let _ = tcsetpgrp(io::stdin(), state.jobs.shell_pgid());

    if outcome.stopped {
        let id = state
            .jobs
            .add_stopped(pgid, outcome.remaining, pipeline.render());
        eprintln!("[{}] {}  stopped  {}", id, pgid, pipeline.render());
    }
    Ok(outcome.status)
}

/// Evaluates one pipeline. Builtins may claim a single-stage foreground
/// command before any process is started; everything else goes through the
/// orchestrator.
pub fn eval(state: &mut State, pipeline: &Pipeline) -> i32 {
    let claimable = pipeline.stages.len() == 1
        && !pipeline.is_background
        && pipeline.stages[0].redirect == crate::types::Redirect::default();
    if claimable {
        let argv = &pipeline.stages[0].argv;
        if builtin::try_autocd(argv) {
            return 0;
        }
        if let Some(name) = argv.first() {
            if let Some(func) = builtin::match_builtin(name) {
                return func(state, argv);
            }
        }
    }

    match run_pipeline(state, pipeline) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("mish: {}", err);
            1
        }
    }
}
