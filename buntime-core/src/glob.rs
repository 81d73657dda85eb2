//! # Glob Matching
//!
//! Compiles glob patterns into anchored regexes for public-route exemptions
//! and policy resource matching.
//!
//! Semantics:
//! - `*` matches any run of characters except `/`
//! - `**` matches any run of characters including `/`
//! - `?` matches exactly one character that is not `/`
//! - everything else matches literally
//!
//! A [`GlobSet`] compiles an array of patterns into a single matcher that
//! matches iff any member matches.

use regex::Regex;

/// A single compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn compile(pattern: &str) -> Result<Self, String> {
        let regex = Regex::new(&glob_to_regex(pattern))
            .map_err(|e| format!("invalid glob pattern {pattern:?}: {e}"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// A set of globs matching iff any member matches. An empty set matches
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    globs: Vec<Glob>,
}

impl GlobSet {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, String> {
        let globs = patterns
            .iter()
            .map(|p| Glob::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { globs })
    }

    pub fn matches(&self, input: &str) -> bool {
        self.globs.iter().any(|g| g.matches(input))
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.globs.len()
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            // regex metacharacters taken literally
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}
