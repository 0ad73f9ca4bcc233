//! Runtime operations shared by the interpreter and compiled code.
//!
//! Every generic opcode and every `Call` helper of a compiled unit ends up
//! in one of these functions, so both execution modes produce identical
//! results and identical exceptions.
//!
//! The primitive functions at the bottom define the unboxed arithmetic of
//! static code. They never raise: a `None` result means division by zero,
//! which compiled code turns into a deopt and the interpreter into
//! `ZeroDivisionError`.

use crate::attr;
use crate::generator;
use crate::iterator::{RangeIterator, SeqIterator};
use crate::vm::Vm;
use ember_bytecode::{BinOp, CmpOp, PrimitiveKind};
use ember_runtime::{
    builtin_types, values_equal, DictObject, ExceptionObject, InstanceLayout, PyErr, PyResult,
    TypeObject, Value,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// One step of an iterator or delegate.
#[derive(Debug, Clone)]
pub enum IterStep {
    /// The iterator produced a value.
    Yield(Value),
    /// The iterator finished with a return value.
    Return(Value),
}

// =============================================================================
// Special Methods
// =============================================================================

/// Call special method `name` looked up on the type of `obj`.
///
/// Returns `None` when the type does not define it.
pub fn call_special(
    vm: &mut Vm,
    obj: &Value,
    name: &str,
    args: Vec<Value>,
) -> PyResult<Option<Value>> {
    let Value::Instance(inst) = obj else {
        return Ok(None);
    };
    let Some(method) = inst.class().lookup(name) else {
        return Ok(None);
    };
    attr::call_bound(vm, &method, obj, args).map(Some)
}

// =============================================================================
// Arithmetic
// =============================================================================

/// Generic binary operator.
pub fn binary_op(vm: &mut Vm, op: BinOp, lhs: &Value, rhs: &Value) -> PyResult<Value> {
    if let Some(result) = numeric_binary(op, lhs, rhs) {
        return result;
    }
    match (op, lhs, rhs) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            return Ok(Value::str(&s));
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            return Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()));
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.snapshot();
            items.extend(b.snapshot());
            return Ok(Value::new_list(items));
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            return Ok(Value::str(&s.repeat((*n).max(0) as usize)));
        }
        (BinOp::Mul, Value::List(l), Value::Int(n)) => {
            let items = l.snapshot();
            let mut out = Vec::with_capacity(items.len() * (*n).max(0) as usize);
            for _ in 0..(*n).max(0) {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::new_list(out));
        }
        (BinOp::Or, Value::Type(_), _) | (BinOp::Or, _, Value::Type(_)) => {
            return Ok(Value::tuple(vec![lhs.clone(), rhs.clone()]));
        }
        _ => {}
    }

    let (name, rname) = dunder_names(op);
    if let Some(result) = call_special(vm, lhs, name, vec![rhs.clone()])? {
        return Ok(result);
    }
    if let Some(result) = call_special(vm, rhs, rname, vec![lhs.clone()])? {
        return Ok(result);
    }
    Err(PyErr::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        lhs.type_name(),
        rhs.type_name()
    )))
}

fn dunder_names(op: BinOp) -> (&'static str, &'static str) {
    match op {
        BinOp::Add => ("__add__", "__radd__"),
        BinOp::Sub => ("__sub__", "__rsub__"),
        BinOp::Mul => ("__mul__", "__rmul__"),
        BinOp::TrueDiv => ("__truediv__", "__rtruediv__"),
        BinOp::FloorDiv => ("__floordiv__", "__rfloordiv__"),
        BinOp::Mod => ("__mod__", "__rmod__"),
        BinOp::And => ("__and__", "__rand__"),
        BinOp::Or => ("__or__", "__ror__"),
        BinOp::Xor => ("__xor__", "__rxor__"),
        BinOp::LShift => ("__lshift__", "__rlshift__"),
        BinOp::RShift => ("__rshift__", "__rrshift__"),
    }
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Bool(_) | Value::Float(_))
}

fn numeric_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Option<PyResult<Value>> {
    if !is_numeric(lhs) || !is_numeric(rhs) {
        return None;
    }
    if let (Value::Bool(a), Value::Bool(b)) = (lhs, rhs) {
        match op {
            BinOp::And => return Some(Ok(Value::Bool(a & b))),
            BinOp::Or => return Some(Ok(Value::Bool(a | b))),
            BinOp::Xor => return Some(Ok(Value::Bool(a ^ b))),
            _ => {}
        }
    }
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        let (a, b) = (lhs.as_float()?, rhs.as_float()?);
        return float_binary(op, a, b);
    }
    let (a, b) = (lhs.as_int()?, rhs.as_int()?);
    Some(int_binary(op, a, b))
}

fn overflow() -> PyErr {
    PyErr::overflow("integer overflow")
}

fn int_binary(op: BinOp, a: i64, b: i64) -> PyResult<Value> {
    let v = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::TrueDiv => {
            if b == 0 {
                return Err(PyErr::zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(PyErr::zero_division("integer division or modulo by zero"));
            }
            if a == i64::MIN && b == -1 {
                return Err(overflow());
            }
            floor_div_i64(a, b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(PyErr::zero_division("integer modulo by zero"));
            }
            py_mod_i64(a, b)
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::LShift => {
            if b < 0 {
                return Err(PyErr::value_error("negative shift count"));
            }
            if a == 0 {
                0
            } else if b >= 63 {
                return Err(overflow());
            } else {
                let r = a << b;
                if r >> b != a {
                    return Err(overflow());
                }
                r
            }
        }
        BinOp::RShift => {
            if b < 0 {
                return Err(PyErr::value_error("negative shift count"));
            }
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
    };
    Ok(Value::Int(v))
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Option<PyResult<Value>> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Some(Err(PyErr::zero_division("float division by zero")));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Some(Err(PyErr::zero_division("float floor division by zero")));
            }
            floor_div_f64(a, b)
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Some(Err(PyErr::zero_division("float modulo")));
            }
            py_mod_f64(a, b)
        }
        _ => return None,
    };
    Some(Ok(Value::Float(v)))
}

/// Floor division that wraps on overflow.
#[inline]
pub fn floor_div_i64(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// Modulo with the sign of the divisor.
#[inline]
pub fn py_mod_i64(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        r.wrapping_add(b)
    } else {
        r
    }
}

#[inline]
pub fn floor_div_f64(a: f64, b: f64) -> f64 {
    (a / b).floor()
}

#[inline]
pub fn py_mod_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

/// `not v`.
pub fn unary_not(vm: &mut Vm, v: &Value) -> PyResult<Value> {
    Ok(Value::Bool(!truthy(vm, v)?))
}

/// `-v`.
pub fn unary_negative(vm: &mut Vm, v: &Value) -> PyResult<Value> {
    match v {
        Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        Value::Bool(b) => Ok(Value::Int(-(*b as i64))),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => match call_special(vm, v, "__neg__", Vec::new())? {
            Some(result) => Ok(result),
            None => Err(PyErr::type_error(format!(
                "bad operand type for unary -: '{}'",
                v.type_name()
            ))),
        },
    }
}

/// Truth value, calling `__bool__` or `__len__` where defined.
pub fn truthy(vm: &mut Vm, v: &Value) -> PyResult<bool> {
    let Value::Instance(_) = v else {
        return Ok(v.is_truthy());
    };
    if let Some(result) = call_special(vm, v, "__bool__", Vec::new())? {
        return match result {
            Value::Bool(b) => Ok(b),
            other => Err(PyErr::type_error(format!(
                "__bool__ should return bool, returned {}",
                other.type_name()
            ))),
        };
    }
    if let Some(result) = call_special(vm, v, "__len__", Vec::new())? {
        return match result.as_int() {
            Some(n) if n >= 0 => Ok(n != 0),
            Some(_) => Err(PyErr::value_error("__len__() should return >= 0")),
            None => Err(PyErr::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                result.type_name()
            ))),
        };
    }
    Ok(true)
}

// =============================================================================
// Comparison
// =============================================================================

/// Comparison, identity or containment test.
pub fn compare_op(vm: &mut Vm, op: CmpOp, lhs: &Value, rhs: &Value) -> PyResult<Value> {
    match op {
        CmpOp::Is => Ok(Value::Bool(lhs.is(rhs))),
        CmpOp::IsNot => Ok(Value::Bool(!lhs.is(rhs))),
        CmpOp::In => Ok(Value::Bool(contains(vm, rhs, lhs)?)),
        CmpOp::NotIn => Ok(Value::Bool(!contains(vm, rhs, lhs)?)),
        CmpOp::Eq => rich_eq(vm, lhs, rhs),
        CmpOp::Ne => {
            if let Some(result) = call_special(vm, lhs, "__ne__", vec![rhs.clone()])? {
                return Ok(result);
            }
            let eq = rich_eq(vm, lhs, rhs)?;
            Ok(Value::Bool(!truthy(vm, &eq)?))
        }
        _ => rich_order(vm, op, lhs, rhs).map(Value::Bool),
    }
}

fn rich_eq(vm: &mut Vm, lhs: &Value, rhs: &Value) -> PyResult<Value> {
    if let Some(result) = call_special(vm, lhs, "__eq__", vec![rhs.clone()])? {
        return Ok(result);
    }
    if let Some(result) = call_special(vm, rhs, "__eq__", vec![lhs.clone()])? {
        return Ok(result);
    }
    Ok(Value::Bool(values_equal(lhs, rhs)))
}

/// Equality as a Rust bool.
pub fn equals(vm: &mut Vm, lhs: &Value, rhs: &Value) -> PyResult<bool> {
    if lhs.is(rhs) {
        return Ok(true);
    }
    let eq = rich_eq(vm, lhs, rhs)?;
    truthy(vm, &eq)
}

fn ordering_names(op: CmpOp) -> (&'static str, &'static str) {
    match op {
        CmpOp::Lt => ("__lt__", "__gt__"),
        CmpOp::Le => ("__le__", "__ge__"),
        CmpOp::Gt => ("__gt__", "__lt__"),
        _ => ("__ge__", "__le__"),
    }
}

fn apply_ordering(op: CmpOp, ord: Ordering) -> bool {
    match op {
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
        CmpOp::Eq => ord == Ordering::Equal,
        _ => ord != Ordering::Equal,
    }
}

fn rich_order(vm: &mut Vm, op: CmpOp, lhs: &Value, rhs: &Value) -> PyResult<bool> {
    if is_numeric(lhs) && is_numeric(rhs) {
        if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
            let (a, b) = (lhs.as_float().unwrap_or(0.0), rhs.as_float().unwrap_or(0.0));
            return Ok(prim_compare(op, a, b));
        }
        let (a, b) = (lhs.as_int().unwrap_or(0), rhs.as_int().unwrap_or(0));
        return Ok(prim_compare(op, a, b));
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => return Ok(apply_ordering(op, a.cmp(b))),
        (Value::Tuple(a), Value::Tuple(b)) => return seq_order(vm, op, a, b),
        (Value::List(a), Value::List(b)) => return seq_order(vm, op, &a.snapshot(), &b.snapshot()),
        _ => {}
    }
    let (name, reflected) = ordering_names(op);
    if let Some(result) = call_special(vm, lhs, name, vec![rhs.clone()])? {
        return truthy(vm, &result);
    }
    if let Some(result) = call_special(vm, rhs, reflected, vec![lhs.clone()])? {
        return truthy(vm, &result);
    }
    Err(PyErr::type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op,
        lhs.type_name(),
        rhs.type_name()
    )))
}

fn seq_order(vm: &mut Vm, op: CmpOp, a: &[Value], b: &[Value]) -> PyResult<bool> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !equals(vm, x, y)? {
            return rich_order(vm, op, x, y);
        }
    }
    Ok(apply_ordering(op, a.len().cmp(&b.len())))
}

/// `item in container`.
pub fn contains(vm: &mut Vm, container: &Value, item: &Value) -> PyResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(PyErr::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Tuple(items) => seq_contains(vm, items, item),
        Value::List(list) => seq_contains(vm, &list.snapshot(), item),
        Value::Dict(dict) => Ok(dict.get(item)?.is_some()),
        _ => {
            if let Some(result) = call_special(vm, container, "__contains__", vec![item.clone()])? {
                return truthy(vm, &result);
            }
            let iter = get_iter(vm, container)?;
            while let Some(v) = iter_next(vm, &iter)? {
                if equals(vm, &v, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn seq_contains(vm: &mut Vm, items: &[Value], item: &Value) -> PyResult<bool> {
    for v in items {
        if equals(vm, v, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// =============================================================================
// Iteration
// =============================================================================

/// `iter(v)`.
pub fn get_iter(vm: &mut Vm, v: &Value) -> PyResult<Value> {
    match v {
        Value::Tuple(items) => Ok(Value::native(SeqIterator::tuple(items.clone()))),
        Value::List(list) => Ok(Value::native(SeqIterator::list(list.clone()))),
        Value::Str(s) => Ok(Value::native(SeqIterator::values(
            s.chars().map(|c| Value::str(c.encode_utf8(&mut [0; 4]))).collect(),
        ))),
        Value::Dict(dict) => Ok(Value::native(SeqIterator::values(dict.keys()))),
        Value::Native(_) if v.downcast_ref::<SeqIterator>().is_some() => Ok(v.clone()),
        Value::Native(_) if v.downcast_ref::<RangeIterator>().is_some() => Ok(v.clone()),
        Value::Native(_) => generator::get_iter(v).unwrap_or_else(|| not_iterable(v)),
        _ => match call_special(vm, v, "__iter__", Vec::new())? {
            Some(it) => Ok(it),
            None => not_iterable(v),
        },
    }
}

fn not_iterable(v: &Value) -> PyResult<Value> {
    Err(PyErr::type_error(format!(
        "'{}' object is not iterable",
        v.type_name()
    )))
}

/// Advance an iterator, keeping the return value of a finished delegate.
pub fn iter_step(vm: &mut Vm, it: &Value) -> PyResult<IterStep> {
    if let Some(seq) = it.downcast_ref::<SeqIterator>() {
        return Ok(seq.next_value().map_or(IterStep::Return(Value::None), IterStep::Yield));
    }
    if let Some(range) = it.downcast_ref::<RangeIterator>() {
        return Ok(range.next_value().map_or(IterStep::Return(Value::None), IterStep::Yield));
    }
    if let Some(step) = generator::send_native(vm, it, Value::None) {
        return step;
    }
    match call_special(vm, it, "__next__", Vec::new()) {
        Ok(Some(v)) => Ok(IterStep::Yield(v)),
        Ok(None) => Err(PyErr::type_error(format!(
            "'{}' object is not an iterator",
            it.type_name()
        ))),
        Err(e) if e.is_stop_iteration() => Ok(IterStep::Return(e.exception().value())),
        Err(e) => Err(e),
    }
}

/// `next(it)`, with `None` on exhaustion.
pub fn iter_next(vm: &mut Vm, it: &Value) -> PyResult<Option<Value>> {
    match iter_step(vm, it)? {
        IterStep::Yield(v) => Ok(Some(v)),
        IterStep::Return(_) => Ok(None),
    }
}

/// Send `value` into a delegate: generators and awaitables receive it,
/// plain iterators only accept `None`.
pub fn send_to(vm: &mut Vm, it: &Value, value: Value) -> PyResult<IterStep> {
    if let Some(step) = generator::send_native(vm, it, value.clone()) {
        return step;
    }
    if value.is_none() {
        return iter_step(vm, it);
    }
    let send = attr::get_attr(vm, it, "send")?;
    match vm.call(&send, vec![value]) {
        Ok(v) => Ok(IterStep::Yield(v)),
        Err(e) if e.is_stop_iteration() => Ok(IterStep::Return(e.exception().value())),
        Err(e) => Err(e),
    }
}

/// Collect every item of an iterable.
pub fn collect(vm: &mut Vm, iterable: &Value) -> PyResult<Vec<Value>> {
    match iterable {
        Value::Tuple(items) => Ok(items.to_vec()),
        Value::List(list) => Ok(list.snapshot()),
        _ => {
            let it = get_iter(vm, iterable)?;
            let mut out = Vec::new();
            while let Some(v) = iter_next(vm, &it)? {
                out.push(v);
            }
            Ok(out)
        }
    }
}

// =============================================================================
// Containers
// =============================================================================

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn index_of(v: &Value) -> PyResult<i64> {
    v.as_int().ok_or_else(|| {
        PyErr::type_error(format!(
            "indices must be integers, not {}",
            v.type_name()
        ))
    })
}

/// `container[index]`.
pub fn subscr(vm: &mut Vm, container: &Value, index: &Value) -> PyResult<Value> {
    match container {
        Value::Tuple(items) => normalize_index(index_of(index)?, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| PyErr::index_error("tuple index out of range")),
        Value::List(list) => normalize_index(index_of(index)?, list.len())
            .and_then(|i| list.get(i))
            .ok_or_else(|| PyErr::index_error("list index out of range")),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            normalize_index(index_of(index)?, chars.len())
                .map(|i| Value::str(chars[i].encode_utf8(&mut [0; 4])))
                .ok_or_else(|| PyErr::index_error("string index out of range"))
        }
        Value::Dict(dict) => dict
            .get(index)?
            .ok_or_else(|| PyErr::key_error(index.repr())),
        _ => match call_special(vm, container, "__getitem__", vec![index.clone()])? {
            Some(v) => Ok(v),
            None => Err(PyErr::type_error(format!(
                "'{}' object is not subscriptable",
                container.type_name()
            ))),
        },
    }
}

/// `container[index] = value`.
pub fn store_subscr(vm: &mut Vm, container: &Value, index: &Value, value: Value) -> PyResult<()> {
    match container {
        Value::List(list) => {
            let i = normalize_index(index_of(index)?, list.len())
                .ok_or_else(|| PyErr::index_error("list assignment index out of range"))?;
            list.set(i, value);
            Ok(())
        }
        Value::Dict(dict) => dict.set(index.clone(), value),
        _ => match call_special(vm, container, "__setitem__", vec![index.clone(), value])? {
            Some(_) => Ok(()),
            None => Err(PyErr::type_error(format!(
                "'{}' object does not support item assignment",
                container.type_name()
            ))),
        },
    }
}

/// Unpack exactly `count` items, in sequence order.
pub fn unpack_sequence(vm: &mut Vm, v: &Value, count: usize) -> PyResult<Vec<Value>> {
    let items = collect(vm, v).map_err(|e| {
        if e.matches(&builtin_types().type_error) {
            PyErr::type_error(format!(
                "cannot unpack non-iterable {} object",
                v.type_name()
            ))
        } else {
            e
        }
    })?;
    match items.len().cmp(&count) {
        Ordering::Equal => Ok(items),
        Ordering::Less => Err(PyErr::value_error(format!(
            "not enough values to unpack (expected {}, got {})",
            count,
            items.len()
        ))),
        Ordering::Greater => Err(PyErr::value_error(format!(
            "too many values to unpack (expected {})",
            count
        ))),
    }
}

/// Build a dict from `[k0, v0, k1, v1, ...]`.
pub fn build_map(items: &[Value]) -> PyResult<Value> {
    let dict = DictObject::new();
    for pair in items.chunks(2) {
        if let [k, v] = pair {
            dict.set(k.clone(), v.clone())?;
        }
    }
    Ok(Value::Dict(Arc::new(dict)))
}

/// `len(v)`.
pub fn get_len(vm: &mut Vm, v: &Value) -> PyResult<i64> {
    let n = match v {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::List(list) => list.len(),
        Value::Dict(dict) => dict.len(),
        _ => {
            return match call_special(vm, v, "__len__", Vec::new())? {
                Some(n) => n.as_int().ok_or_else(|| {
                    PyErr::type_error(format!(
                        "'{}' object cannot be interpreted as an integer",
                        n.type_name()
                    ))
                }),
                None => Err(PyErr::type_error(format!(
                    "object of type '{}' has no len()",
                    v.type_name()
                ))),
            }
        }
    };
    Ok(n as i64)
}

// =============================================================================
// Pattern Matching
// =============================================================================

/// Whether `v` matches a sequence pattern.
pub fn match_sequence(v: &Value) -> bool {
    matches!(v, Value::Tuple(_) | Value::List(_))
}

/// Whether `v` matches a mapping pattern.
pub fn match_mapping(v: &Value) -> bool {
    matches!(v, Value::Dict(_))
}

/// Class pattern: `None` if `subject` is not an instance of `class`,
/// otherwise the tuple of its first `count` `__match_args__` attributes.
pub fn match_class(vm: &mut Vm, subject: &Value, class: &Value, count: usize) -> PyResult<Value> {
    let Value::Type(cls) = class else {
        return Err(PyErr::type_error("called match pattern must be a class"));
    };
    if !subject.class().is_subtype(cls) {
        return Ok(Value::None);
    }
    if count == 0 {
        return Ok(Value::tuple(Vec::new()));
    }
    let names = match cls.lookup("__match_args__") {
        Some(Value::Tuple(names)) => names,
        Some(_) => return Err(PyErr::type_error(format!("{}.__match_args__ must be a tuple", cls.name()))),
        None => Arc::from(Vec::new()),
    };
    if count > names.len() {
        return Err(PyErr::type_error(format!(
            "{}() accepts {} positional sub-pattern{} ({} given)",
            cls.name(),
            names.len(),
            if names.len() == 1 { "" } else { "s" },
            count
        )));
    }
    let mut out = Vec::with_capacity(count);
    for name in names.iter().take(count) {
        let Value::Str(name) = name else {
            return Err(PyErr::type_error("__match_args__ elements must be strings"));
        };
        match attr::get_attr(vm, subject, name) {
            Ok(v) => out.push(v),
            Err(e) if e.matches(&builtin_types().attribute_error) => return Ok(Value::None),
            Err(e) => return Err(e),
        }
    }
    Ok(Value::tuple(out))
}

// =============================================================================
// Exceptions
// =============================================================================

/// `isinstance(v, cls)`.
pub fn isinstance(v: &Value, cls: &TypeObject) -> bool {
    v.class().is_subtype(cls)
}

fn exception_class(v: &Value) -> PyResult<&Arc<TypeObject>> {
    match v {
        Value::Type(t) if t.is_subtype(&builtin_types().base_exception) => Ok(t),
        _ => Err(PyErr::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

/// Whether `exc` matches an `except` clause naming `spec` (a class or tuple).
pub fn exception_matches(exc: &Value, spec: &Value) -> PyResult<bool> {
    let class = exc.class();
    match spec {
        Value::Tuple(items) => {
            for item in items.iter() {
                if class.is_subtype(exception_class(item)?) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Ok(class.is_subtype(exception_class(other)?)),
    }
}

/// Turn a raised value into an exception, instantiating classes.
pub fn make_exception(vm: &mut Vm, v: &Value) -> PyResult<PyErr> {
    match v {
        Value::Exception(exc) => Ok(PyErr::from_exception(exc.clone())),
        Value::Type(t) if t.layout() == InstanceLayout::Exception => match vm.call(v, Vec::new())? {
            Value::Exception(exc) => Ok(PyErr::from_exception(exc)),
            other => Err(PyErr::type_error(format!(
                "calling {} should have returned an instance of BaseException, not {}",
                t.name(),
                other.type_name()
            ))),
        },
        _ => Err(PyErr::type_error("exceptions must derive from BaseException")),
    }
}

/// `raise exc from cause`.
pub fn raise_from(vm: &mut Vm, exc: &Value, cause: &Value) -> PyResult<PyErr> {
    let err = make_exception(vm, exc)?;
    let cause: Option<Arc<ExceptionObject>> = match cause {
        Value::None => None,
        other => Some(make_exception(vm, other)?.0),
    };
    err.exception().set_cause(cause);
    Ok(err)
}

// =============================================================================
// Primitive Arithmetic
// =============================================================================

/// Unboxed `int64` operator. `None` on division by zero.
#[inline]
pub fn prim_i64(op: BinOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::TrueDiv => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return None;
            }
            floor_div_i64(a, b)
        }
        BinOp::Mod => {
            if b == 0 {
                return None;
            }
            py_mod_i64(a, b)
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::LShift => a.wrapping_shl((b & 63) as u32),
        BinOp::RShift => a.wrapping_shr((b & 63) as u32),
    })
}

/// Unboxed `double` operator. `None` on division by zero or an operator
/// not defined on doubles.
#[inline]
pub fn prim_f64(op: BinOp, a: f64, b: f64) -> Option<f64> {
    Some(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv if b != 0.0 => a / b,
        BinOp::FloorDiv if b != 0.0 => floor_div_f64(a, b),
        BinOp::Mod if b != 0.0 => py_mod_f64(a, b),
        _ => return None,
    })
}

/// Unboxed `cbool` operator.
#[inline]
pub fn prim_bool(op: BinOp, a: bool, b: bool) -> Option<bool> {
    match op {
        BinOp::And => Some(a & b),
        BinOp::Or => Some(a | b),
        BinOp::Xor => Some(a ^ b),
        _ => None,
    }
}

/// Unboxed ordering comparison.
#[inline]
pub fn prim_compare<T: PartialOrd>(op: CmpOp, a: T, b: T) -> bool {
    match op {
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        _ => false,
    }
}

/// `ZeroDivisionError` raised by the interpreter for a primitive operator.
pub fn prim_zero_division(kind: PrimitiveKind) -> PyErr {
    match kind {
        PrimitiveKind::Float64 => PyErr::zero_division("float division by zero"),
        _ => PyErr::zero_division("integer division or modulo by zero"),
    }
}
