//! Builds a [`Pipeline`] from a raw input line: background detection, stage
//! splitting at unquoted `|`, per-stage scanning and expansion, redirection
//! extraction and alias expansion of the first stage.

use crate::builtin::ShellEnv;
use crate::expand;
use crate::token;
use crate::types::{Pipeline, Redirect, Stage};

use tracing::debug;

/// Tracks quoting at line granularity, just enough to know whether a `|` or
/// a trailing `&` sits inside a quote span. Coarser than the scanner's state
/// machine on purpose; the two are applied at different levels.
#[derive(Default)]
struct QuoteToggle {
    single: bool,
    double: bool,
}

impl QuoteToggle {
    fn step(&mut self, c: char) {
        if c == '"' && !self.single {
            self.double = !self.double;
        } else if c == '\'' && !self.double {
            self.single = !self.single;
        }
    }

    fn outside(&self) -> bool {
        !self.single && !self.double
    }
}

/// Splits a line into stage texts at `|` characters outside quote spans.
/// Empty stage texts are dropped.
fn split_stages(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut quotes = QuoteToggle::default();

    for c in line.chars() {
        quotes.step(c);
        if c == '|' && quotes.outside() {
            if !cur.is_empty() {
                parts.push(std::mem::take(&mut cur));
            }
        } else {
            cur.push(c);
        }
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    parts
}

/// Strips trailing whitespace and a final unquoted `&`. Returns the text to
/// split into stages plus the background flag.
fn detach_background(line: &str) -> (&str, bool) {
    let trimmed = line.trim_end();
    if !trimmed.ends_with('&') {
        return (trimmed, false);
    }
    let mut quotes = QuoteToggle::default();
    for c in trimmed.chars() {
        quotes.step(c);
    }
    if quotes.outside() {
        (trimmed[..trimmed.len() - 1].trim_end(), true)
    } else {
        (trimmed, false)
    }
}

/// Pulls `<`, `>` and `>>` operators (each with its following path word) out
/// of the word list, leaving the argument vector behind. The last occurrence
/// of each redirection kind wins. An operator with no following word is left
/// in the argument vector.
fn extract_redirections(words: Vec<String>) -> (Vec<String>, Redirect) {
    let mut argv = Vec::with_capacity(words.len());
    let mut redirect = Redirect::default();
    let mut it = words.into_iter().peekable();

    while let Some(word) = it.next() {
        match word.as_str() {
            "<" if it.peek().is_some() => redirect.input = it.next(),
            ">" if it.peek().is_some() => {
                redirect.output = it.next();
                redirect.append = false;
            }
            ">>" if it.peek().is_some() => {
                redirect.output = it.next();
                redirect.append = true;
            }
            _ => argv.push(word),
        }
    }
    (argv, redirect)
}

fn build_stage(text: &str) -> Stage {
    let words: Vec<String> = token::scan(text)
        .iter()
        .flat_map(|t| expand::expand(t))
        .collect();
    let (argv, redirect) = extract_redirections(words);
    Stage { argv, redirect }
}

/// Builds the pipeline for one input line, or `None` if the line holds no
/// stages at all.
pub fn build(line: &str, env: &ShellEnv) -> Option<Pipeline> {
    let (text, is_background) = detach_background(line);
    let mut stages: Vec<Stage> = split_stages(text).iter().map(|s| build_stage(s)).collect();
    if stages.is_empty() {
        return None;
    }

    let first = &mut stages[0];
    first.argv = env.alias_expand(std::mem::take(&mut first.argv));

    let pipeline = Pipeline { stages, is_background };
    debug!(
        stages = pipeline.stages.len(),
        background = is_background,
        "pipeline built"
    );
    Some(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_plain(line: &str) -> Option<Pipeline> {
        build(line, &ShellEnv::default())
    }

    #[test]
    fn quoted_pipe_does_not_split() {
        let p = build_plain(r#"echo "a|b" | cat"#).unwrap();
        assert_eq!(p.stages.len(), 2);
        assert_eq!(p.stages[0].argv, vec!["echo", "a|b"]);
        assert_eq!(p.stages[1].argv, vec!["cat"]);
    }

    #[test]
    fn redirections_are_extracted() {
        let p = build_plain("cmd > out.txt < in.txt").unwrap();
        let stage = &p.stages[0];
        assert_eq!(stage.argv, vec!["cmd"]);
        assert_eq!(stage.redirect.input.as_deref(), Some("in.txt"));
        assert_eq!(stage.redirect.output.as_deref(), Some("out.txt"));
        assert!(!stage.redirect.append);
    }

    #[test]
    fn later_redirection_wins() {
        let p = build_plain("cmd > a.txt >> b.txt").unwrap();
        let stage = &p.stages[0];
        assert_eq!(stage.redirect.output.as_deref(), Some("b.txt"));
        assert!(stage.redirect.append);
    }

    #[test]
    fn dangling_operator_stays_in_argv() {
        let p = build_plain("cmd >").unwrap();
        assert_eq!(p.stages[0].argv, vec!["cmd", ">"]);
        assert_eq!(p.stages[0].redirect.output, None);
    }

    #[test]
    fn trailing_ampersand_sets_background() {
        let p = build_plain("sleep 5 &").unwrap();
        assert!(p.is_background);
        assert_eq!(p.stages[0].argv, vec!["sleep", "5"]);
    }

    #[test]
    fn quoted_ampersand_is_not_background() {
        let p = build_plain(r#"echo "x&""#).unwrap();
        assert!(!p.is_background);
        assert_eq!(p.stages[0].argv, vec!["echo", "x&"]);
    }

    #[test]
    fn blank_line_yields_no_pipeline() {
        assert!(build_plain("   \t ").is_none());
        assert!(build_plain("").is_none());
        assert!(build_plain("|").is_none());
    }

    #[test]
    fn whitespace_stages_have_empty_argv() {
        let p = build_plain(" | cat").unwrap();
        assert_eq!(p.stages.len(), 2);
        assert!(p.stages[0].argv.is_empty());
        assert_eq!(p.stages[1].argv, vec!["cat"]);
    }

    #[test]
    fn alias_rewrites_first_stage_only() {
        let mut env = ShellEnv::default();
        env.aliases.insert("ll".into(), "ls -l".into());
        let p = build("ll /tmp | ll", &env).unwrap();
        assert_eq!(p.stages[0].argv, vec!["ls", "-l", "/tmp"]);
        assert_eq!(p.stages[1].argv, vec!["ll"]);
    }

    #[test]
    fn command_text_renders_stages() {
        let p = build_plain("echo hi | cat &").unwrap();
        assert_eq!(p.render(), "echo hi | cat");
    }
}
