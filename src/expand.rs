//! Word expansion: tilde, command substitution, parameter substitution and
//! filename globbing, applied per word in that fixed order.
//!
//! Expansion never fails a pipeline. Every step degrades to leaving the text
//! as a literal on a lookup miss, a malformed form or a spawn failure.

use std::env;
use std::io::Read;
use std::process::{Command, Stdio};

use tracing::debug;

/// Expands one scanned word into zero or more final words. All steps are
/// 1:1 except globbing, which may fan a word out into many paths.
pub fn expand(word: &str) -> Vec<String> {
    let scalar = expand_parameters(&expand_commands(&expand_tilde(word)));
    expand_glob(&scalar)
}

/// `~` or `~/...` becomes the home directory from the environment. `~user`
/// and a missing `HOME` leave the word untouched.
fn expand_tilde(word: &str) -> String {
    if word.starts_with('~') && (word.len() == 1 || word[1..].starts_with('/')) {
        if let Ok(home) = env::var("HOME") {
            return format!("{}{}", home, &word[1..]);
        }
    }
    word.to_string()
}

/// Runs `text` through `/bin/sh -c` with stdout captured; stdin and stderr
/// are inherited. A spawn failure degrades to empty replacement text.
fn run_substitution(text: &str) -> String {
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(text)
        .stdout(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            debug!(command = text, %err, "command substitution spawn failed");
            return String::new();
        }
    };

    let mut captured = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_end(&mut captured);
    }
    let _ = child.wait();

    let mut out = String::from_utf8_lossy(&captured).into_owned();
    while out.ends_with('\n') || out.ends_with('\r') {
        out.pop();
    }
    out
}

/// Replaces `` `...` `` and `$(...)` spans with the captured output of the
/// enclosed command. The first matching closing delimiter wins; nesting is
/// not supported, and replacement text is never rescanned.
fn expand_commands(word: &str) -> String {
    let mut out = String::new();
    let mut rest = word;

    loop {
        let backtick = rest.find('`');
        let dollar = rest.find("$(");
        let (start, open_len, close) = match (backtick, dollar) {
            (Some(b), Some(d)) if b < d => (b, 1, '`'),
            (Some(_), Some(d)) => (d, 2, ')'),
            (Some(b), None) => (b, 1, '`'),
            (None, Some(d)) => (d, 2, ')'),
            (None, None) => {
                out.push_str(rest);
                return out;
            }
        };

        let body_start = start + open_len;
        match rest[body_start..].find(close) {
            Some(len) => {
                out.push_str(&rest[..start]);
                out.push_str(&run_substitution(&rest[body_start..body_start + len]));
                rest = &rest[body_start + len + 1..];
            }
            None => {
                // Unterminated span: the delimiter stays literal and
                // scanning continues after it.
                out.push_str(&rest[..start + 1]);
                rest = &rest[start + 1..];
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn env_or_empty(name: &str) -> String {
    env::var(name).unwrap_or_default()
}

/// Replaces `${name}` and bare `$name` with the environment variable's
/// value, or the empty string if unset. A `$` not followed by a valid name
/// or a closed brace stays literal.
fn expand_parameters(word: &str) -> String {
    let mut out = String::new();
    let mut rest = word;

    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];

        if let Some(body) = tail.strip_prefix('{') {
            if let Some(len) = body.find('}') {
                out.push_str(&env_or_empty(&body[..len]));
                rest = &body[len + 1..];
                continue;
            }
        } else {
            let len = tail.chars().take_while(|&c| is_name_char(c)).count();
            if len > 0 {
                out.push_str(&env_or_empty(&tail[..len]));
                rest = &tail[len..];
                continue;
            }
        }

        out.push('$');
        rest = tail;
    }

    out.push_str(rest);
    out
}

/// Interprets the word as a glob pattern. One or more matches replace the
/// word with the sorted match list; no match (or a bad pattern) keeps the
/// word unchanged.
fn expand_glob(word: &str) -> Vec<String> {
    let paths = match glob::glob(word) {
        Ok(paths) => paths,
        Err(_) => return vec![word.to_string()],
    };
    let matches: Vec<String> = paths
        .filter_map(Result::ok)
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if matches.is_empty() {
        vec![word.to_string()]
    } else {
        matches
    }
}
