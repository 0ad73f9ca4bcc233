//! Inlining policy and bookkeeping.
//!
//! A call site is an inlining candidate when its callee is statically
//! known, which in practice means a global preloaded to a function. The
//! candidate is then checked against the rules below; a rejection records
//! exactly one [`InlineFailureType`] against the callee's
//! `module:qualname`.

use ember_runtime::{FunctionFlags, FunctionObject};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Default limit on nested inline frames below the compiled function.
pub const DEFAULT_MAX_INLINE_DEPTH: usize = 4;

/// Why a candidate callee was not inlined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InlineFailureType {
    HasDefaults,
    HasKwOnlyArgs,
    HasVarargs,
    HasVarkwargs,
    CalledWithMismatchedArgs,
    IsGenerator,
    IsRecursive,
    HasPrimitiveArgs,
    IsSuppressed,
    NotJittable,
    MaxDepthExceeded,
}

impl InlineFailureType {
    /// Stable name reported by inline statistics.
    pub const fn name(self) -> &'static str {
        match self {
            InlineFailureType::HasDefaults => "HasDefaults",
            InlineFailureType::HasKwOnlyArgs => "HasKwOnlyArgs",
            InlineFailureType::HasVarargs => "HasVarargs",
            InlineFailureType::HasVarkwargs => "HasVarkwargs",
            InlineFailureType::CalledWithMismatchedArgs => "CalledWithMismatchedArgs",
            InlineFailureType::IsGenerator => "IsGenerator",
            InlineFailureType::IsRecursive => "IsRecursive",
            InlineFailureType::HasPrimitiveArgs => "HasPrimitiveArgs",
            InlineFailureType::IsSuppressed => "IsSuppressed",
            InlineFailureType::NotJittable => "NotJittable",
            InlineFailureType::MaxDepthExceeded => "MaxDepthExceeded",
        }
    }

    /// Explanation used in debug logging.
    pub const fn message(self) -> &'static str {
        match self {
            InlineFailureType::HasDefaults => "it has default arguments",
            InlineFailureType::HasKwOnlyArgs => "it has keyword-only args",
            InlineFailureType::HasVarargs => "it has *args",
            InlineFailureType::HasVarkwargs => "it has **kwargs",
            InlineFailureType::CalledWithMismatchedArgs => {
                "it is called with mismatched arguments"
            }
            InlineFailureType::IsGenerator => "it is a generator",
            InlineFailureType::IsRecursive => "it is already being inlined",
            InlineFailureType::HasPrimitiveArgs => "it has primitive args or return",
            InlineFailureType::IsSuppressed => "it is suppressed",
            InlineFailureType::NotJittable => "its body cannot be compiled",
            InlineFailureType::MaxDepthExceeded => "the inline depth limit was reached",
        }
    }
}

impl fmt::Display for InlineFailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inlining outcome for one compiled unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineStats {
    /// Call sites replaced by the callee's body.
    pub num_inlined: usize,
    /// Rejected callees by reason.
    pub failures: BTreeMap<InlineFailureType, BTreeSet<String>>,
}

impl InlineStats {
    /// Record a rejected callee.
    pub fn record_failure(&mut self, reason: InlineFailureType, callee: &FunctionObject) {
        let name = callee.full_name();
        tracing::debug!(callee = %name, reason = reason.name(), "can't inline: {}", reason.message());
        self.failures.entry(reason).or_default().insert(name);
    }
}

/// Check whether `callee` may be inlined at a site passing `argc`
/// positional arguments.
///
/// `chain` holds the code ids of the compiled function and every frame
/// already inlined around the site; `depth` is the number of inline frames
/// that would enclose the callee.
pub fn can_inline(
    callee: &FunctionObject,
    argc: usize,
    chain: &[u64],
    depth: usize,
    max_depth: usize,
) -> Result<(), InlineFailureType> {
    let code = &callee.code;
    if callee.defaults().is_some() {
        return Err(InlineFailureType::HasDefaults);
    }
    if code.kwonlyarg_count > 0 {
        return Err(InlineFailureType::HasKwOnlyArgs);
    }
    if code.flags.contains(ember_bytecode::CodeFlags::VARARGS) {
        return Err(InlineFailureType::HasVarargs);
    }
    if code.flags.contains(ember_bytecode::CodeFlags::VARKEYWORDS) {
        return Err(InlineFailureType::HasVarkwargs);
    }
    if code.arg_count as usize != argc {
        return Err(InlineFailureType::CalledWithMismatchedArgs);
    }
    if code.is_resumable() {
        return Err(InlineFailureType::IsGenerator);
    }
    if callee.native().is_some() || code.has_primitive_signature() {
        return Err(InlineFailureType::HasPrimitiveArgs);
    }
    let flags = callee.flags();
    if flags.contains(FunctionFlags::JIT_SUPPRESSED) {
        return Err(InlineFailureType::IsSuppressed);
    }
    if flags.contains(FunctionFlags::NOT_JITTABLE) {
        return Err(InlineFailureType::NotJittable);
    }
    if chain.contains(&code.id) {
        return Err(InlineFailureType::IsRecursive);
    }
    if depth > max_depth {
        return Err(InlineFailureType::MaxDepthExceeded);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_bytecode::{FunctionBuilder, LocalType, PrimitiveKind};
    use ember_runtime::{DictObject, Value};
    use std::sync::Arc;

    fn function(build: impl FnOnce(&mut FunctionBuilder)) -> FunctionObject {
        let mut b = FunctionBuilder::new("callee");
        build(&mut b);
        b.return_none();
        let code = Arc::new(b.finish().unwrap());
        FunctionObject::new(code, Arc::new(DictObject::new()), Arc::new(DictObject::new()))
    }

    #[test]
    fn test_simple_callee_is_inlinable() {
        let f = function(|b| b.set_params(&["a", "b"]));
        assert_eq!(can_inline(&f, 2, &[], 1, 4), Ok(()));
    }

    #[test]
    fn test_rejections() {
        let f = function(|b| b.set_params(&["a"]));
        assert_eq!(
            can_inline(&f, 2, &[], 1, 4),
            Err(InlineFailureType::CalledWithMismatchedArgs)
        );
        assert_eq!(
            can_inline(&f, 1, &[f.code.id], 1, 4),
            Err(InlineFailureType::IsRecursive)
        );
        assert_eq!(
            can_inline(&f, 1, &[], 5, 4),
            Err(InlineFailureType::MaxDepthExceeded)
        );

        f.set_defaults(Some(Arc::from(vec![Value::Int(1)])));
        assert_eq!(can_inline(&f, 1, &[], 1, 4), Err(InlineFailureType::HasDefaults));

        let g = function(|b| {
            b.set_params(&["a"]);
            b.set_varargs("rest");
        });
        assert_eq!(can_inline(&g, 1, &[], 1, 4), Err(InlineFailureType::HasVarargs));

        let p = function(|b| {
            b.set_params(&["n"]);
            b.set_local_type("n", LocalType::Primitive(PrimitiveKind::Int64));
        });
        assert_eq!(can_inline(&p, 1, &[], 1, 4), Err(InlineFailureType::HasPrimitiveArgs));

        let s = function(|_| {});
        s.add_flags(FunctionFlags::JIT_SUPPRESSED);
        assert_eq!(can_inline(&s, 0, &[], 1, 4), Err(InlineFailureType::IsSuppressed));
    }

    #[test]
    fn test_stats_group_by_reason() {
        let f = function(|_| {});
        let mut stats = InlineStats::default();
        stats.record_failure(InlineFailureType::HasVarargs, &f);
        stats.record_failure(InlineFailureType::HasVarargs, &f);
        assert_eq!(stats.failures[&InlineFailureType::HasVarargs].len(), 1);
        assert!(stats.failures[&InlineFailureType::HasVarargs].contains("__main__:callee"));
    }
}
