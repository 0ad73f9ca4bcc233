//! JIT list: the set of functions allowed to compile.
//!
//! A JIT list file holds one `module:qualname` per line. Blank lines and
//! lines starting with `#` are ignored. With wildcards enabled, `*` in
//! either component matches any run of characters, so `app.*:handle` or
//! `app:Server.*` select whole families of functions.

use ember_runtime::FunctionObject;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// JIT list loading failure.
#[derive(Debug, Error)]
pub enum JitListError {
    #[error("cannot read JIT list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JIT list line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// A wildcard entry, split into its two patterns.
#[derive(Debug, Clone)]
struct Pattern {
    module: String,
    qualname: String,
}

/// Parsed JIT list.
#[derive(Debug, Clone, Default)]
pub struct JitList {
    exact: FxHashMap<String, FxHashSet<String>>,
    patterns: Vec<Pattern>,
    wildcards: bool,
}

impl JitList {
    /// Empty list.
    pub fn new(wildcards: bool) -> Self {
        Self {
            wildcards,
            ..Self::default()
        }
    }

    /// Load a list from a file.
    pub fn from_file(path: &Path, wildcards: bool) -> Result<Self, JitListError> {
        let text = std::fs::read_to_string(path).map_err(|source| JitListError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let list = Self::parse(&text, wildcards)?;
        tracing::debug!(path = %path.display(), entries = list.len(), "loaded JIT list");
        Ok(list)
    }

    /// Parse list text.
    pub fn parse(text: &str, wildcards: bool) -> Result<Self, JitListError> {
        let mut list = Self::new(wildcards);
        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            list.add_entry(line).map_err(|message| JitListError::Parse {
                line: i + 1,
                message,
            })?;
        }
        Ok(list)
    }

    /// Add one `module:qualname` entry.
    pub fn add_entry(&mut self, entry: &str) -> Result<(), String> {
        let Some((module, qualname)) = entry.split_once(':') else {
            return Err(format!("expected 'module:qualname', got '{}'", entry));
        };
        let (module, qualname) = (module.trim(), qualname.trim());
        if module.is_empty() || qualname.is_empty() || qualname.contains(':') {
            return Err(format!("malformed entry '{}'", entry));
        }
        if module.contains('*') || qualname.contains('*') {
            if !self.wildcards {
                return Err(format!("wildcard in '{}' but wildcards are disabled", entry));
            }
            self.patterns.push(Pattern {
                module: module.to_owned(),
                qualname: qualname.to_owned(),
            });
        } else {
            self.exact
                .entry(module.to_owned())
                .or_default()
                .insert(qualname.to_owned());
        }
        Ok(())
    }

    /// Whether `module:qualname` is selected.
    pub fn lookup(&self, module: &str, qualname: &str) -> bool {
        if self
            .exact
            .get(module)
            .map_or(false, |names| names.contains(qualname))
        {
            return true;
        }
        self.patterns
            .iter()
            .any(|p| glob_match(&p.module, module) && glob_match(&p.qualname, qualname))
    }

    /// Whether `func` is selected.
    #[inline]
    pub fn contains(&self, func: &FunctionObject) -> bool {
        self.lookup(&func.module, &func.qualname)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.exact.values().map(|s| s.len()).sum::<usize>() + self.patterns.len()
    }

    /// Whether the list selects nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries as `module:qualname`, exact ones sorted, then patterns in
    /// file order.
    pub fn entries(&self) -> Vec<String> {
        let mut exact: Vec<String> = self
            .exact
            .iter()
            .flat_map(|(module, names)| names.iter().map(move |q| format!("{}:{}", module, q)))
            .collect();
        exact.sort();
        exact.extend(self.patterns.iter().map(|p| format!("{}:{}", p.module, p.qualname)));
        exact
    }
}

/// Match `text` against `pattern`, where `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No `*` at all.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
