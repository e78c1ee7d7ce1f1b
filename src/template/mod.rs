//! Command templating.
//!
//! A template is a text pattern expanded once per task with the task's
//! argument line. Substitution forms:
//!
//! - `{}` the full argument
//! - `{/}` basename, `{//}` directory
//! - `{.}` extension removed, `{/.}` basename without extension,
//!   `{/-}` basename without any extensions
//! - `{[i]}` i-th whitespace token (negative counts from the end)
//! - `{[a:b:s]}` whitespace slice with optional start/stop/step
//! - `{% CMD @ %}` stdout of `CMD` run in a sub-shell with `@` replaced by
//!   the argument, trailing newline stripped
//! - `{= EXPR =}` sandboxed expression in one free variable `x`
//!
//! Templates are parsed up front so malformed patterns are rejected before
//! any task is dispatched; expansion failures mark the task failed without
//! running it.

mod expr;

use std::collections::BTreeMap;
use std::process::Stdio;

use crate::error::{HyperError, Result};

pub use expr::Expr;

pub const DEFAULT_TEMPLATE: &str = "{}";

/// Shell used for `{% %}` splices and for task commands.
pub fn shell() -> (&'static str, &'static str) {
    if cfg!(windows) {
        ("cmd", "/c")
    } else {
        ("/bin/sh", "-c")
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Full,
    Basename,
    Dirname,
    StripExt,
    BasenameStripExt,
    BasenameStripAll,
    Index(i64),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    Subshell(String),
    Lambda(Expr),
}

impl Segment {
    fn substitutes(&self) -> bool {
        !matches!(self, Segment::Literal(_))
    }
}

/// A parsed command template.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template pattern. Unterminated `{% %}` / `{= =}` splices and
    /// malformed slice specs are hard errors; braces that match no known
    /// form (e.g. awk bodies) pass through as literal text.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(pos) = rest.find('{') {
            literal.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(body) = tail.strip_prefix("{%") {
                let end = body.find("%}").ok_or_else(|| {
                    HyperError::Parse(format!("unterminated '{{%' in template: {source}"))
                })?;
                flush(&mut segments, &mut literal);
                segments.push(Segment::Subshell(body[..end].trim().to_string()));
                rest = &body[end + 2..];
            } else if let Some(body) = tail.strip_prefix("{=") {
                let end = body.find("=}").ok_or_else(|| {
                    HyperError::Parse(format!("unterminated '{{=' in template: {source}"))
                })?;
                flush(&mut segments, &mut literal);
                segments.push(Segment::Lambda(Expr::parse(body[..end].trim())?));
                rest = &body[end + 2..];
            } else if let Some(end) = tail.find('}') {
                let inner = &tail[1..end];
                match parse_brace(inner)? {
                    Some(segment) => {
                        flush(&mut segments, &mut literal);
                        segments.push(segment);
                    }
                    None => literal.push_str(&tail[..end + 1]),
                }
                rest = &tail[end + 1..];
            } else {
                // Lone '{' with no closing brace, keep it literal.
                literal.push('{');
                rest = &tail[1..];
            }
        }
        literal.push_str(rest);
        flush(&mut segments, &mut literal);

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the pattern contains no substitution at all, in which case
    /// the argument is appended to the expanded text.
    fn appends_args(&self) -> bool {
        !self.segments.iter().any(Segment::substitutes)
    }

    /// True for templates whose expansion is a pure function of the
    /// argument (no `{% %}` sub-shell splice).
    pub fn is_pure(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|segment| matches!(segment, Segment::Subshell(_)))
    }

    /// Expand against a task argument. `env` is the injected task
    /// environment, applied to `{% %}` sub-shells.
    pub async fn expand(&self, args: &str, env: &BTreeMap<String, String>) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Full => out.push_str(args),
                Segment::Basename => out.push_str(basename(args)),
                Segment::Dirname => out.push_str(dirname(args)),
                Segment::StripExt => out.push_str(strip_ext(args)),
                Segment::BasenameStripExt => out.push_str(strip_ext(basename(args))),
                Segment::BasenameStripAll => out.push_str(strip_all_ext(basename(args))),
                Segment::Index(index) => out.push_str(token_at(args, *index)?),
                Segment::Slice { start, stop, step } => {
                    out.push_str(&token_slice(args, *start, *stop, *step)?)
                }
                Segment::Subshell(command) => out.push_str(&subshell(command, args, env).await?),
                Segment::Lambda(expr) => out.push_str(&expr.eval(args)?),
            }
        }
        if self.appends_args() && !args.is_empty() {
            out.push(' ');
            out.push_str(args);
        }
        Ok(out)
    }
}

impl Default for Template {
    fn default() -> Self {
        Self::parse(DEFAULT_TEMPLATE).expect("default template must parse")
    }
}

fn flush(segments: &mut Vec<Segment>, literal: &mut String) {
    if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(literal)));
    }
}

/// Interpret the text between plain braces. `None` means "not a form,
/// leave it literal".
fn parse_brace(inner: &str) -> Result<Option<Segment>> {
    match inner {
        "" => return Ok(Some(Segment::Full)),
        "/" => return Ok(Some(Segment::Basename)),
        "//" => return Ok(Some(Segment::Dirname)),
        "." => return Ok(Some(Segment::StripExt)),
        "/." => return Ok(Some(Segment::BasenameStripExt)),
        "/-" => return Ok(Some(Segment::BasenameStripAll)),
        _ => {}
    }
    let Some(spec) = inner.strip_prefix('[').and_then(|s| s.strip_suffix(']')) else {
        return Ok(None);
    };
    if spec.contains(':') {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() > 3 {
            return Err(HyperError::Parse(format!("bad slice '{{[{spec}]}}'")));
        }
        let part = |index: usize| -> Result<Option<i64>> {
            match parts.get(index).copied().unwrap_or("") {
                "" => Ok(None),
                text => text.parse().map(Some).map_err(|_| {
                    HyperError::Parse(format!("bad slice component '{text}' in '{{[{spec}]}}'"))
                }),
            }
        };
        let step = part(2)?;
        if step == Some(0) {
            return Err(HyperError::Parse(format!("zero step in '{{[{spec}]}}'")));
        }
        Ok(Some(Segment::Slice {
            start: part(0)?,
            stop: part(1)?,
            step,
        }))
    } else {
        let index = spec
            .trim()
            .parse()
            .map_err(|_| HyperError::Parse(format!("bad index '{{[{spec}]}}'")))?;
        Ok(Some(Segment::Index(index)))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => ".",
    }
}

fn strip_ext(path: &str) -> &str {
    let base_start = path.len() - basename(path).len();
    match path[base_start..].rfind('.') {
        Some(pos) if pos > 0 => &path[..base_start + pos],
        _ => path,
    }
}

fn strip_all_ext(base: &str) -> &str {
    match base.find('.') {
        Some(pos) if pos > 0 => &base[..pos],
        _ => base,
    }
}

fn tokens(args: &str) -> Vec<&str> {
    args.split_whitespace().collect()
}

fn resolve(index: i64, len: usize) -> Option<usize> {
    if index < 0 {
        let back = index.unsigned_abs() as usize;
        len.checked_sub(back)
    } else if (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

fn token_at(args: &str, index: i64) -> Result<&str> {
    let words = tokens(args);
    resolve(index, words.len())
        .map(|i| words[i])
        .ok_or_else(|| {
            HyperError::Parse(format!(
                "index {index} out of range for {} token(s): '{args}'",
                words.len()
            ))
        })
}

fn token_slice(
    args: &str,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<String> {
    let words = tokens(args);
    let len = words.len() as i64;
    let step = step.unwrap_or(1);
    let clamp = |index: i64| -> i64 {
        let resolved = if index < 0 { index + len } else { index };
        resolved.clamp(0, len)
    };
    let mut picked = Vec::new();
    if step > 0 {
        let (from, to) = (clamp(start.unwrap_or(0)), clamp(stop.unwrap_or(len)));
        let mut index = from;
        while index < to {
            picked.push(words[index as usize]);
            index += step;
        }
    } else {
        let from = match start {
            Some(value) => clamp(value).min(len - 1),
            None => len - 1,
        };
        let to = match stop {
            Some(value) => {
                let resolved = if value < 0 { value + len } else { value };
                resolved.max(-1)
            }
            None => -1,
        };
        let mut index = from;
        while index > to && index >= 0 {
            picked.push(words[index as usize]);
            index += step;
        }
    }
    Ok(picked.join(" "))
}

/// Run `CMD` with `@` replaced by the argument, capturing stdout.
async fn subshell(command: &str, args: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let spliced = command.replace('@', args);
    let (shell, flag) = shell();
    let output = tokio::process::Command::new(shell)
        .arg(flag)
        .arg(&spliced)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| HyperError::Parse(format!("sub-shell '{spliced}' failed to start: {err}")))?;
    if !output.status.success() {
        return Err(HyperError::Parse(format!(
            "sub-shell '{spliced}' exited with {}",
            output.status.code().unwrap_or(-1)
        )));
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn expand(template: &str, args: &str) -> String {
        Template::parse(template)
            .unwrap()
            .expand(args, &BTreeMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_substitution() {
        assert_eq!(expand("echo {}", "hello").await, "echo hello");
    }

    #[tokio::test]
    async fn args_appended_without_token() {
        assert_eq!(expand("wc -l", "notes.txt").await, "wc -l notes.txt");
    }

    #[tokio::test]
    async fn path_forms() {
        let arg = "/data/runs/sample.tar.gz";
        assert_eq!(expand("{/}", arg).await, "sample.tar.gz");
        assert_eq!(expand("{//}", arg).await, "/data/runs");
        assert_eq!(expand("{.}", arg).await, "/data/runs/sample.tar");
        assert_eq!(expand("{/.}", arg).await, "sample.tar");
        assert_eq!(expand("{/-}", arg).await, "sample");
    }

    #[tokio::test]
    async fn dirname_of_bare_file() {
        assert_eq!(expand("{//}", "notes.txt").await, ".");
        assert_eq!(expand("{//}", "/notes.txt").await, "/");
    }

    #[tokio::test]
    async fn hidden_file_keeps_name() {
        assert_eq!(expand("{.}", ".bashrc").await, ".bashrc");
        assert_eq!(expand("{/-}", ".bashrc").await, ".bashrc");
    }

    #[tokio::test]
    async fn index_tokens() {
        assert_eq!(expand("{[0]}", "a b c").await, "a");
        assert_eq!(expand("{[2]}", "a b c").await, "c");
        assert_eq!(expand("{[-1]}", "a b c").await, "c");
        assert_eq!(expand("{[-3]}", "a b c").await, "a");
    }

    #[tokio::test]
    async fn index_out_of_range() {
        let template = Template::parse("{[5]}").unwrap();
        let err = template.expand("a b c", &BTreeMap::new()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn slices() {
        let arg = "one two three four";
        assert_eq!(expand("echo {[1:3]}", arg).await, "echo two three");
        assert_eq!(expand("{[:2]}", arg).await, "one two");
        assert_eq!(expand("{[2:]}", arg).await, "three four");
        assert_eq!(expand("{[::2]}", arg).await, "one three");
        assert_eq!(expand("{[::-1]}", arg).await, "four three two one");
        assert_eq!(expand("{[-2:]}", arg).await, "three four");
    }

    #[tokio::test]
    async fn empty_slice_is_empty() {
        assert_eq!(expand("{[3:1]}", "a b c d").await, "");
    }

    #[tokio::test]
    async fn shell_braces_stay_literal() {
        assert_eq!(
            expand("awk '{print $1}' {}", "data.csv").await,
            "awk '{print $1}' data.csv"
        );
    }

    #[test]
    fn unterminated_splices_rejected() {
        assert!(Template::parse("{% basename @").is_err());
        assert!(Template::parse("{= x + 1").is_err());
    }

    #[test]
    fn malformed_slices_rejected() {
        assert!(Template::parse("{[a]}").is_err());
        assert!(Template::parse("{[1:b]}").is_err());
        assert!(Template::parse("{[1:2:3:4]}").is_err());
        assert!(Template::parse("{[::0]}").is_err());
    }

    #[test]
    fn purity_flag() {
        assert!(Template::parse("echo {}").unwrap().is_pure());
        assert!(Template::parse("{= len(x) =}").unwrap().is_pure());
        assert!(!Template::parse("{% echo @ %}").unwrap().is_pure());
    }

    #[tokio::test]
    async fn subshell_splice() {
        assert_eq!(
            expand("cp {} {% basename @ %}", "/tmp/file.txt").await,
            "cp /tmp/file.txt file.txt"
        );
    }

    #[tokio::test]
    async fn subshell_failure_reported() {
        let template = Template::parse("{% false @ %}").unwrap();
        let err = template.expand("x", &BTreeMap::new()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn lambda_expansion() {
        assert_eq!(expand("{= x + '.bak' =}", "file").await, "file.bak");
        assert_eq!(expand("{= len(x) * 2 =}", "abcd").await, "8");
    }

    #[tokio::test]
    async fn multiple_substitutions() {
        assert_eq!(
            expand("mv {} {//}/done/{/}", "/a/b/c.txt").await,
            "mv /a/b/c.txt /a/b/done/c.txt"
        );
    }
}
