//! Execution engine of the Ember VM.
//!
//! - Bytecode interpreter and the executor for compiled units
//! - Versioned inline caches for attribute and method access
//! - Watched global caches with lazy-import resolution
//! - Shadow stack with lazily materialized frames
//! - Generators, coroutines and async generators over interpreted or
//!   compiled bodies
//! - Deoptimization back to the interpreter
//! - Compilation policy and the `jit` introspection module
#![deny(unsafe_op_in_unsafe_fn)]

pub mod attr;
pub mod builtins;
pub mod config;
pub mod deopt;
pub mod executor;
pub mod generator;
pub mod global_cache;
pub mod inline_cache;
pub mod interpreter;
pub mod iterator;
pub mod jit_driver;
pub mod jit_module;
pub mod native;
pub mod ops;
pub mod shadow;
pub mod spill;
pub mod vm;

pub use config::{ConfigError, JitConfig};
pub use deopt::{DeoptError, DeoptKey, DeoptStats};
pub use executor::Word;
pub use generator::{GenKind, GenState, GeneratorObject};
pub use global_cache::{GlobalCacheManager, GlobalCacheStats};
pub use inline_cache::{IcStats, MissReason, SiteKind};
pub use jit_driver::{BatchStats, JitDriver};
pub use native::{NativeError, NativeLibraries};
pub use shadow::{FrameObject, ShadowStack};
pub use vm::{Runtime, Vm, DEFAULT_RECURSION_LIMIT};
