//! Builtin commands, the alias table and the `~/.mishrc` loader.
//!
//! Builtins claim a command before it reaches the orchestrator; dispatch is
//! a table lookup on the head word. Handlers get the whole argument vector,
//! head included, and return an exit status.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::global::State;

const ALIAS_EXPAND_MAX_DEPTH: usize = 10;

/// Shell-local (non-exported) state the builtins operate on.
#[derive(Debug, Default)]
pub struct ShellEnv {
    pub aliases: HashMap<String, String>,
}

impl ShellEnv {
    /// Rewrites the head word through the alias table, re-expanding until
    /// the head no longer names an alias. Expansion is bounded by a fixed
    /// depth, and a self-referential alias expands exactly once.
    pub fn alias_expand(&self, argv: Vec<String>) -> Vec<String> {
        let mut argv = argv;
        for _ in 0..ALIAS_EXPAND_MAX_DEPTH {
            let Some(head) = argv.first() else { break };
            let Some(body) = self.aliases.get(head) else { break };
            let words: Vec<String> = body.split_whitespace().map(str::to_string).collect();
            let Some(new_head) = words.first() else { break };

            let self_referential = new_head == head;
            let mut expanded = words;
            expanded.extend(argv.into_iter().skip(1));
            argv = expanded;
            if self_referential {
                break;
            }
        }
        argv
    }
}

fn unquote_if(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let q = bytes[0];
        if (q == b'\'' || q == b'"') && bytes[bytes.len() - 1] == q {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Evaluates one line of an rc file. Supports comments and the `alias`,
/// `export`, `echo` and `setprompt` forms; anything else is ignored.
pub fn eval_rc_line(env: &mut ShellEnv, line: &str) {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return;
    }

    if let Some(rest) = line.strip_prefix("alias ") {
        if let Some((key, val)) = rest.split_once('=') {
            env.aliases
                .insert(key.trim().to_string(), unquote_if(val.trim()).to_string());
        }
        return;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        if let Some((key, val)) = rest.split_once('=') {
            env::set_var(key.trim(), val.trim());
        }
        return;
    }

    if let Some(rest) = line.strip_prefix("echo ") {
        println!("{}", rest);
        return;
    }

    if let Some(rest) = line.strip_prefix("setprompt ") {
        env::set_var("MISH_PROMPT", unquote_if(rest.trim()));
    }
}

fn rc_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mishrc"))
}

/// Loads `~/.mishrc` at startup. A missing file is not an error.
pub fn load_rc(env: &mut ShellEnv) {
    let Some(path) = rc_path() else { return };
    let Ok(text) = fs::read_to_string(&path) else { return };
    debug!(path = %path.display(), "loading rc file");
    for line in text.lines() {
        eval_rc_line(env, line);
    }
}

/// A bare directory name changes into that directory.
pub fn try_autocd(argv: &[String]) -> bool {
    let Some(head) = argv.first() else { return false };
    if Path::new(head).is_dir() {
        if let Err(err) = env::set_current_dir(head) {
            eprintln!("cd: {}", err);
        }
        return true;
    }
    false
}

fn builtin_cd(_: &mut State, argv: &[String]) -> i32 {
    let target = argv
        .get(1)
        .cloned()
        .or_else(|| env::var("HOME").ok())
        .unwrap_or_else(|| "/".to_string());
    match env::set_current_dir(&target) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("cd: {}", err);
            1
        }
    }
}

fn builtin_pwd(_: &mut State, _: &[String]) -> i32 {
    match env::current_dir() {
        Ok(dir) => {
            println!("{}", dir.display());
            0
        }
        Err(err) => {
            eprintln!("pwd: {}", err);
            1
        }
    }
}

fn builtin_echo(_: &mut State, argv: &[String]) -> i32 {
    println!("{}", argv[1..].join(" "));
    0
}

fn builtin_export(_: &mut State, argv: &[String]) -> i32 {
    for arg in &argv[1..] {
        if let Some((key, val)) = arg.split_once('=') {
            env::set_var(key, val);
        }
    }
    0
}

fn builtin_unset(_: &mut State, argv: &[String]) -> i32 {
    for arg in &argv[1..] {
        env::remove_var(arg);
    }
    0
}

fn builtin_alias(state: &mut State, argv: &[String]) -> i32 {
    if argv.len() == 1 {
        for (key, val) in &state.env.aliases {
            println!("alias {}='{}'", key, val);
        }
        return 0;
    }
    for arg in &argv[1..] {
        if let Some((key, val)) = arg.split_once('=') {
            state
                .env
                .aliases
                .insert(key.to_string(), unquote_if(val).to_string());
        }
    }
    0
}

fn builtin_unalias(state: &mut State, argv: &[String]) -> i32 {
    if let Some(name) = argv.get(1) {
        state.env.aliases.remove(name);
    }
    0
}

fn builtin_source(state: &mut State, argv: &[String]) -> i32 {
    let Some(path) = argv.get(1) else {
        eprintln!("source: path required");
        return 1;
    };
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => {
            eprintln!("source: cannot open {}", path);
            return 1;
        }
    };
    for line in text.lines() {
        eval_rc_line(&mut state.env, line);
    }
    0
}

fn builtin_jobs(state: &mut State, _: &[String]) -> i32 {
    let _ = state.jobs.list(std::io::stdout());
    0
}

fn parse_job_id(name: &str, argv: &[String]) -> Option<u32> {
    match argv.get(1).and_then(|s| s.parse().ok()) {
        Some(id) => Some(id),
        None => {
            eprintln!("{}: job id required", name);
            None
        }
    }
}

fn builtin_fg(state: &mut State, argv: &[String]) -> i32 {
    let Some(id) = parse_job_id("fg", argv) else { return 1 };
    match state.jobs.fg(id) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("fg: {}", err);
            1
        }
    }
}

fn builtin_bg(state: &mut State, argv: &[String]) -> i32 {
    let Some(id) = parse_job_id("bg", argv) else { return 1 };
    match state.jobs.bg(id) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("bg: {}", err);
            1
        }
    }
}

type Builtin = fn(&mut State, &[String]) -> i32;

pub fn match_builtin(name: &str) -> Option<Builtin> {
    match name {
        "cd" => Some(builtin_cd),
        "pwd" => Some(builtin_pwd),
        "echo" => Some(builtin_echo),
        "export" => Some(builtin_export),
        "unset" => Some(builtin_unset),
        "alias" => Some(builtin_alias),
        "unalias" => Some(builtin_unalias),
        "source" | "." => Some(builtin_source),
        "jobs" => Some(builtin_jobs),
        "fg" => Some(builtin_fg),
        "bg" => Some(builtin_bg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn alias_expand_replaces_head() {
        let mut env = ShellEnv::default();
        env.aliases.insert("ll".into(), "ls -l".into());
        assert_eq!(
            env.alias_expand(argv(&["ll", "/tmp"])),
            argv(&["ls", "-l", "/tmp"])
        );
    }

    #[test]
    fn alias_expand_chains() {
        let mut env = ShellEnv::default();
        env.aliases.insert("a".into(), "b -x".into());
        env.aliases.insert("b".into(), "c -y".into());
        assert_eq!(
            env.alias_expand(argv(&["a", "z"])),
            argv(&["c", "-y", "-x", "z"])
        );
    }

    #[test]
    fn self_referential_alias_expands_once() {
        let mut env = ShellEnv::default();
        env.aliases.insert("ls".into(), "ls --color".into());
        assert_eq!(
            env.alias_expand(argv(&["ls", "/tmp"])),
            argv(&["ls", "--color", "/tmp"])
        );
    }

    #[test]
    fn alias_loop_is_depth_bounded() {
        let mut env = ShellEnv::default();
        env.aliases.insert("a".into(), "b".into());
        env.aliases.insert("b".into(), "a".into());
        // Terminates; the surviving head is one of the two names.
        let out = env.alias_expand(argv(&["a"]));
        assert_eq!(out.len(), 1);
        assert!(out[0] == "a" || out[0] == "b");
    }

    #[test]
    fn empty_alias_body_stops_expansion() {
        let mut env = ShellEnv::default();
        env.aliases.insert("x".into(), "   ".into());
        assert_eq!(env.alias_expand(argv(&["x", "y"])), argv(&["x", "y"]));
    }

    #[test]
    fn unknown_head_passes_through() {
        let env = ShellEnv::default();
        assert_eq!(env.alias_expand(argv(&["ls"])), argv(&["ls"]));
    }

    #[test]
    fn rc_line_defines_alias() {
        let mut env = ShellEnv::default();
        eval_rc_line(&mut env, "alias gs='git status'");
        assert_eq!(env.aliases["gs"], "git status");
    }

    #[test]
    fn rc_line_strips_comments() {
        let mut env = ShellEnv::default();
        eval_rc_line(&mut env, "alias x=y # not read");
        assert_eq!(env.aliases["x"], "y");
        eval_rc_line(&mut env, "# alias z=w");
        assert!(!env.aliases.contains_key("z"));
    }

    #[test]
    fn rc_line_exports_variables() {
        let mut env = ShellEnv::default();
        eval_rc_line(&mut env, "export MISH_TEST_RC=value");
        assert_eq!(env::var("MISH_TEST_RC").unwrap(), "value");
    }

    #[test]
    fn unquote_strips_matching_quotes_only() {
        assert_eq!(unquote_if("'a b'"), "a b");
        assert_eq!(unquote_if("\"a\""), "a");
        assert_eq!(unquote_if("'a\""), "'a\"");
        assert_eq!(unquote_if("a"), "a");
    }
}
