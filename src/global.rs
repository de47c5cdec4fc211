use crate::builtin::ShellEnv;
use crate::job::JobTable;

/// Process-wide shell state: the job table and the builtin environment.
/// Built once at startup and threaded through evaluation by mutable borrow.
#[derive(Debug)]
pub struct State {
    pub jobs: JobTable,
    pub env: ShellEnv,
}

impl State {
    pub fn new() -> State {
        State {
            jobs: JobTable::new(),
            env: ShellEnv::default(),
        }
    }
}
