//! Shell-style exclusion patterns
//!
//! Patterns follow Python's `fnmatch` rules rather than filesystem globbing:
//! `*` matches any run of characters including `/`, so `node_modules/*`
//! excludes the whole subtree. Matching is case-sensitive.
//!
//! | pattern  | meaning                                   |
//! |----------|-------------------------------------------|
//! | `*`      | any sequence, including path separators   |
//! | `?`      | exactly one character                     |
//! | `[seq]`  | one character in `seq` (ranges allowed)   |
//! | `[!seq]` | one character not in `seq`                |

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tidesync_core::{SyncError, SyncResult};

/// Translate a shell pattern into an anchored regular expression.
pub fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let n = chars.len();
    let mut out = String::from("(?s:^");
    let mut i = 0;

    while i < n {
        let c = chars[i];
        i += 1;
        match c {
            '*' => {
                while i < n && chars[i] == '*' {
                    i += 1;
                }
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '[' => {
                let mut j = i;
                if j < n && chars[j] == '!' {
                    j += 1;
                }
                if j < n && chars[j] == ']' {
                    j += 1;
                }
                while j < n && chars[j] != ']' {
                    j += 1;
                }
                if j >= n {
                    out.push_str("\\[");
                    continue;
                }
                let stuff: String = chars[i..j].iter().collect();
                i = j + 1;
                push_class(&mut out, &stuff);
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }

    out.push_str("$)");
    out
}

fn push_class(out: &mut String, stuff: &str) {
    if stuff.is_empty() {
        // Never matches
        out.push_str(r"[^\x00-\x{10FFFF}]");
        return;
    }
    if stuff == "!" {
        out.push('.');
        return;
    }

    out.push('[');
    let body = match stuff.strip_prefix('!') {
        Some(rest) => {
            out.push('^');
            rest
        }
        None => stuff,
    };
    let mut prev = None;
    for ch in body.chars() {
        // A lone `-` stays bare so ranges keep working; `--` is set difference in regex
        if matches!(ch, '\\' | ']' | '[' | '^' | '&' | '~') || (ch == '-' && prev == Some('-')) {
            out.push('\\');
        }
        out.push(ch);
        prev = Some(ch);
    }
    out.push(']');
}

/// One compiled pattern
#[derive(Debug)]
pub struct CompiledPattern {
    pattern: String,
    regex: Regex,
}

impl CompiledPattern {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Pattern compiler with a memo of every pattern it has seen.
///
/// The cache is unbounded and lives as long as the matcher; one matcher per
/// run is the expected usage.
#[derive(Debug, Default)]
pub struct PatternMatcher {
    cache: RwLock<HashMap<String, Arc<CompiledPattern>>>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, pattern: &str) -> SyncResult<Arc<CompiledPattern>> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
        {
            return Ok(hit.clone());
        }

        let regex = Regex::new(&translate(pattern)).map_err(|e| SyncError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let compiled = Arc::new(CompiledPattern {
            pattern: pattern.to_string(),
            regex,
        });

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache
            .entry(pattern.to_string())
            .or_insert(compiled)
            .clone())
    }

    pub fn matches(&self, pattern: &str, path: &str) -> SyncResult<bool> {
        Ok(self.compile(pattern)?.is_match(path))
    }

    /// Names matching `pattern`, in input order
    pub fn filter<'a, S: AsRef<str>>(&self, names: &'a [S], pattern: &str) -> SyncResult<Vec<&'a str>> {
        let compiled = self.compile(pattern)?;
        Ok(names
            .iter()
            .map(AsRef::<str>::as_ref)
            .filter(|name| compiled.is_match(name))
            .collect())
    }

    /// Names not matching `pattern`, in input order
    pub fn filter_out<'a, S: AsRef<str>>(
        &self,
        names: &'a [S],
        pattern: &str,
    ) -> SyncResult<Vec<&'a str>> {
        let compiled = self.compile(pattern)?;
        Ok(names
            .iter()
            .map(AsRef::<str>::as_ref)
            .filter(|name| !compiled.is_match(name))
            .collect())
    }

    /// Number of distinct patterns compiled so far
    pub fn cached(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// The exclude list of one run, compiled up front
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Arc<CompiledPattern>>,
}

impl ExcludeSet {
    pub fn new<S: AsRef<str>>(matcher: &PatternMatcher, patterns: &[S]) -> SyncResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| matcher.compile(p.as_ref()))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
