//! Prompt rendering: `λ <user> <dir> →` with an optional git segment. The
//! arrow reflects the last exit status. `MISH_PROMPT` overrides everything.

use std::env;
use std::io::IsTerminal;
use std::process::Command;

pub mod ansi {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";

    pub const FG_RED: &str = "\x1b[31m";
    pub const FG_GREEN: &str = "\x1b[32m";
    pub const FG_YELLOW: &str = "\x1b[33m";
    pub const FG_MAGENTA: &str = "\x1b[35m";
    pub const FG_CYAN: &str = "\x1b[36m";
    pub const FG_BWHITE: &str = "\x1b[97m";
}

fn color_enabled() -> bool {
    if !std::io::stdout().is_terminal() {
        return false;
    }
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

fn capture(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim_end().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Current git branch with a `*` suffix when the work tree is dirty, or
/// `None` outside a repository.
fn git_branch() -> Option<String> {
    let mut branch = capture("git", &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if capture("git", &["status", "--porcelain"]).is_some() {
        branch.push('*');
    }
    Some(branch)
}

fn cwd_base() -> String {
    env::current_dir()
        .ok()
        .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "?".to_string())
}

pub fn build(last_status: i32) -> String {
    if let Ok(rc) = env::var("MISH_PROMPT") {
        if !rc.is_empty() {
            return rc;
        }
    }

    let user = env::var("USER").unwrap_or_else(|_| "user".to_string());
    let dir = cwd_base();
    let branch = git_branch();

    if !color_enabled() {
        let mut p = format!("λ {} {} → ", user, dir);
        if let Some(branch) = branch {
            p.push_str(&format!("λ git {} → ", branch));
        }
        return p;
    }

    let sep = if last_status == 0 {
        ansi::FG_GREEN
    } else {
        ansi::FG_RED
    };

    let mut p = String::new();
    p.push_str(&format!(
        "{}{}λ{} {}{}{}{} {}{}{}",
        ansi::BOLD,
        ansi::FG_CYAN,
        ansi::RESET,
        ansi::BOLD,
        ansi::FG_BWHITE,
        user,
        ansi::RESET,
        ansi::FG_GREEN,
        dir,
        ansi::RESET,
    ));
    p.push_str(&format!("{}{} → {}", ansi::BOLD, sep, ansi::RESET));

    if let Some(branch) = branch {
        p.push_str(&format!(
            "{}{}λ{} {}git{} {}{}{}",
            ansi::BOLD,
            ansi::FG_CYAN,
            ansi::RESET,
            ansi::FG_MAGENTA,
            ansi::RESET,
            ansi::FG_YELLOW,
            branch,
            ansi::RESET,
        ));
        p.push_str(&format!("{}{} → {}", ansi::BOLD, sep, ansi::RESET));
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_override_wins() {
        env::set_var("MISH_PROMPT", "$ ");
        assert_eq!(build(0), "$ ");
        env::remove_var("MISH_PROMPT");
    }
}
