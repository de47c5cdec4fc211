mod builtin;
mod eval;
mod expand;
mod global;
mod job;
mod parser;
mod prompt;
mod token;
mod types;

use std::path::PathBuf;

use anyhow::Result;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{getpgrp, setpgid, tcsetpgrp, Pid};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mish_history"))
}

/// Puts the shell in its own process group, takes the terminal, suppresses
/// the terminal-access signals and installs the SIGCHLD notification hook.
fn init_shell() -> Result<()> {
    let zero = Pid::from_raw(0);
    let _ = setpgid(zero, zero);
    let _ = tcsetpgrp(std::io::stdin(), getpgrp());

    unsafe {
        signal(Signal::SIGTTIN, SigHandler::SigIgn)?;
        signal(Signal::SIGTTOU, SigHandler::SigIgn)?;
    }
    job::install_sigchld_handler()?;
    Ok(())
}

fn is_exit(pipeline: &types::Pipeline) -> bool {
    pipeline.stages.len() == 1
        && pipeline.stages[0].argv.first().map(String::as_str) == Some("exit")
}

fn run() -> Result<()> {
    init_shell()?;

    let mut state = global::State::new();
    builtin::load_rc(&mut state.env);

    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    let mut last_status = 0;
    loop {
        // Work deferred by the SIGCHLD handler happens here, outside any
        // interruption context.
        if state.jobs.take_pending() {
            state.jobs.reap();
        }

        let line = match editor.readline(&prompt::build(last_status)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("mish: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        let Some(pipeline) = parser::build(&line, &state.env) else {
            continue;
        };
        if is_exit(&pipeline) {
            break;
        }
        last_status = eval::eval(&mut state, &pipeline);
        debug!(status = last_status, "pipeline finished");
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    println!();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MISH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    run()
}
