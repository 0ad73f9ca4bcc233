//! JIT configuration aggregated from `-X` options and environment variables.
//!
//! A single struct captures every JIT setting. It is resolved once when the
//! runtime starts and read without synchronization afterwards.
//!
//! | `-X` option | Environment variable | Effect |
//! |-------------|----------------------|--------|
//! | `jit` / `jit=0` | `EMBERJIT=1` | enable or disable the JIT |
//! | `jit-list-file=PATH` | `EMBERJIT_LIST_FILE` | compile only listed functions |
//! | `jit-enable-jit-list-wildcards` | `EMBERJIT_ENABLE_JIT_LIST_WILDCARDS` | allow `*` in the list |
//! | `jit-perfmap` | `EMBERJIT_PERFMAP` | write `perf-<pid>.map` |
//! | `jit-shadow-frame` | `EMBERJIT_SHADOW_FRAME` | new functions use shadow frames |
//! | `jit-batch-workers=N` | `EMBERJIT_BATCH_WORKERS` | threads for `precompile_all` |
//! | `jit-compile-threshold=N` | `EMBERJIT_COMPILE_THRESHOLD` | calls before compiling |
//! | `jit-disable-inliner` | `EMBERJIT_DISABLE_INLINER` | turn inlining off |
//!
//! `-X` options take precedence over the environment.

use ember_jit::{CompilerConfig, JitList, JitListError, LowerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Default number of `precompile_all` worker threads.
pub const DEFAULT_BATCH_WORKERS: usize = 4;

/// Default inline depth budget.
pub const DEFAULT_MAX_INLINE_DEPTH: usize = 4;

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {option}")]
    InvalidValue { option: String, value: String },

    #[error("unknown JIT option '-X {0}'")]
    UnknownOption(String),

    #[error(transparent)]
    JitList(#[from] JitListError),
}

// =============================================================================
// JIT Configuration
// =============================================================================

/// Complete JIT configuration.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Whether functions compile at all.
    pub enabled: bool,

    /// Restrict compilation to the functions named in this file.
    pub jit_list_file: Option<PathBuf>,

    /// Accept `*` patterns in the JIT list.
    pub jit_list_wildcards: bool,

    /// Write a perf map for external profilers.
    pub perf_map: bool,

    /// Directory of the perf map.
    pub perf_map_dir: PathBuf,

    /// Give new functions shadow frames instead of eager frame objects.
    pub shadow_frame: bool,

    /// Worker threads used by `precompile_all`.
    pub batch_workers: usize,

    /// Number of calls after which a function compiles.
    pub compile_threshold: u32,

    /// Inline statically known callees.
    pub inliner: bool,

    /// Maximum inline nesting.
    pub max_inline_depth: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jit_list_file: None,
            jit_list_wildcards: false,
            perf_map: false,
            perf_map_dir: PathBuf::from("/tmp"),
            shadow_frame: false,
            batch_workers: DEFAULT_BATCH_WORKERS,
            compile_threshold: 1,
            inliner: true,
            max_inline_depth: DEFAULT_MAX_INLINE_DEPTH,
        }
    }
}

impl JitConfig {
    /// Configuration with the JIT turned on and everything else default.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Resolve from `-X` options and the process environment.
    pub fn resolve<S: AsRef<str>>(x_options: &[S]) -> Result<Self, ConfigError> {
        Self::from_sources(x_options, |var| std::env::var(var).ok())
    }

    /// Resolve from `-X` options and an environment lookup.
    ///
    /// Options not starting with `jit` belong to other subsystems and are
    /// ignored.
    pub fn from_sources<S: AsRef<str>>(
        x_options: &[S],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(&env)?;
        for opt in x_options {
            config.apply_option(opt.as_ref())?;
        }
        Ok(config)
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let flag = |var: &str| env(var).map_or(false, |v| !v.is_empty() && v != "0");

        if flag("EMBERJIT") {
            self.enabled = true;
        }
        if let Some(path) = env("EMBERJIT_LIST_FILE").filter(|p| !p.is_empty()) {
            self.jit_list_file = Some(PathBuf::from(path));
            self.enabled = true;
        }
        self.jit_list_wildcards |= flag("EMBERJIT_ENABLE_JIT_LIST_WILDCARDS");
        self.perf_map |= flag("EMBERJIT_PERFMAP");
        self.shadow_frame |= flag("EMBERJIT_SHADOW_FRAME");
        if flag("EMBERJIT_DISABLE_INLINER") {
            self.inliner = false;
        }
        if let Some(v) = env("EMBERJIT_BATCH_WORKERS") {
            self.batch_workers = parse_count("EMBERJIT_BATCH_WORKERS", &v)?;
        }
        if let Some(v) = env("EMBERJIT_COMPILE_THRESHOLD") {
            self.compile_threshold = parse_count("EMBERJIT_COMPILE_THRESHOLD", &v)?;
        }
        Ok(())
    }

    fn apply_option(&mut self, opt: &str) -> Result<(), ConfigError> {
        if !opt.starts_with("jit") {
            return Ok(());
        }
        let (name, value) = match opt.split_once('=') {
            Some((n, v)) => (n, Some(v)),
            None => (opt, None),
        };
        match (name, value) {
            ("jit", None) | ("jit", Some("1" | "on")) => self.enabled = true,
            ("jit", Some("0" | "off")) => self.enabled = false,
            ("jit-list-file", Some(path)) if !path.is_empty() => {
                self.jit_list_file = Some(PathBuf::from(path));
                self.enabled = true;
            }
            ("jit-enable-jit-list-wildcards", None) => self.jit_list_wildcards = true,
            ("jit-perfmap", None) => self.perf_map = true,
            ("jit-perfmap-dir", Some(dir)) if !dir.is_empty() => {
                self.perf_map_dir = PathBuf::from(dir)
            }
            ("jit-shadow-frame", None) => self.shadow_frame = true,
            ("jit-disable-inliner", None) => self.inliner = false,
            ("jit-batch-workers", Some(v)) => self.batch_workers = parse_count(name, v)?,
            ("jit-compile-threshold", Some(v)) => self.compile_threshold = parse_count(name, v)?,
            (_, Some(v)) if is_known(name) => {
                return Err(ConfigError::InvalidValue {
                    option: format!("-X {}", name),
                    value: v.to_owned(),
                })
            }
            _ => return Err(ConfigError::UnknownOption(opt.to_owned())),
        }
        Ok(())
    }

    /// Load the configured JIT list.
    pub fn load_jit_list(&self) -> Result<Option<JitList>, ConfigError> {
        match &self.jit_list_file {
            Some(path) => Ok(Some(JitList::from_file(path, self.jit_list_wildcards)?)),
            None => Ok(None),
        }
    }

    /// Compiler configuration derived from this one.
    pub fn compiler_config(&self) -> Result<CompilerConfig, ConfigError> {
        let jit_list = self.load_jit_list()?.map(Arc::new);
        Ok(CompilerConfig {
            lower: LowerConfig {
                inliner: self.inliner,
                max_inline_depth: self.max_inline_depth,
            },
            jit_list,
            ..CompilerConfig::default()
        })
    }
}

fn is_known(name: &str) -> bool {
    matches!(
        name,
        "jit"
            | "jit-list-file"
            | "jit-enable-jit-list-wildcards"
            | "jit-perfmap"
            | "jit-perfmap-dir"
            | "jit-shadow-frame"
            | "jit-disable-inliner"
            | "jit-batch-workers"
            | "jit-compile-threshold"
    )
}

fn parse_count<T: std::str::FromStr + PartialOrd + From<u8>>(
    option: &str,
    value: &str,
) -> Result<T, ConfigError> {
    match value.trim().parse::<T>() {
        Ok(n) if n >= T::from(1u8) => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            option: option.to_owned(),
            value: value.to_owned(),
        }),
    }
}

// =============================================================================
// Tests
// =============================================================================
