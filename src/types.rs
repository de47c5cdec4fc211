/// Input and output redirection for one pipeline stage. At most one of each
/// kind survives parsing; a later occurrence overwrites an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirect {
    pub input: Option<String>,
    pub output: Option<String>,
    pub append: bool,
}

/// One program invocation within a pipeline: the post-expansion argument
/// vector plus its redirections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub argv: Vec<String>,
    pub redirect: Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    pub is_background: bool,
}

impl Pipeline {
    /// Command text as recorded in the job table.
    pub fn render(&self) -> String {
        self.stages
            .iter()
            .map(|s| s.argv.join(" "))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
