//! Builtin type objects.
//!
//! Built once per process. The exception hierarchy:
//!
//! ```text
//! BaseException
//! ├── GeneratorExit
//! └── Exception
//!     ├── TypeError  ValueError  AttributeError  ImportError  AssertionError
//!     ├── StopIteration  StopAsyncIteration
//!     ├── RuntimeError ── RecursionError, NotImplementedError
//!     ├── NameError ── UnboundLocalError
//!     ├── LookupError ── KeyError, IndexError
//!     └── ArithmeticError ── ZeroDivisionError, OverflowError
//! ```

use crate::object::{InstanceLayout, TypeObject};
use std::sync::{Arc, OnceLock};

/// Every builtin type.
#[derive(Debug)]
pub struct BuiltinTypes {
    pub object: Arc<TypeObject>,
    pub type_: Arc<TypeObject>,
    pub none_type: Arc<TypeObject>,
    pub int: Arc<TypeObject>,
    pub bool: Arc<TypeObject>,
    pub float: Arc<TypeObject>,
    pub str: Arc<TypeObject>,
    pub tuple: Arc<TypeObject>,
    pub list: Arc<TypeObject>,
    pub dict: Arc<TypeObject>,
    pub function: Arc<TypeObject>,
    pub builtin_function: Arc<TypeObject>,
    pub method: Arc<TypeObject>,
    pub property: Arc<TypeObject>,
    pub staticmethod: Arc<TypeObject>,
    pub code: Arc<TypeObject>,
    pub module: Arc<TypeObject>,
    pub lazy_import: Arc<TypeObject>,
    pub frame: Arc<TypeObject>,
    pub iterator: Arc<TypeObject>,
    pub generator: Arc<TypeObject>,
    pub coroutine: Arc<TypeObject>,
    pub async_generator: Arc<TypeObject>,
    pub async_gen_awaitable: Arc<TypeObject>,

    pub base_exception: Arc<TypeObject>,
    pub generator_exit: Arc<TypeObject>,
    pub exception: Arc<TypeObject>,
    pub type_error: Arc<TypeObject>,
    pub value_error: Arc<TypeObject>,
    pub attribute_error: Arc<TypeObject>,
    pub import_error: Arc<TypeObject>,
    pub assertion_error: Arc<TypeObject>,
    pub stop_iteration: Arc<TypeObject>,
    pub stop_async_iteration: Arc<TypeObject>,
    pub runtime_error: Arc<TypeObject>,
    pub recursion_error: Arc<TypeObject>,
    pub not_implemented_error: Arc<TypeObject>,
    pub name_error: Arc<TypeObject>,
    pub unbound_local_error: Arc<TypeObject>,
    pub lookup_error: Arc<TypeObject>,
    pub key_error: Arc<TypeObject>,
    pub index_error: Arc<TypeObject>,
    pub arithmetic_error: Arc<TypeObject>,
    pub zero_division_error: Arc<TypeObject>,
    pub overflow_error: Arc<TypeObject>,
}

impl BuiltinTypes {
    fn build() -> Self {
        use InstanceLayout::{Builtin, Exception, Plain};

        let object = TypeObject::new_root("object");
        let leaf = |name: &str| TypeObject::new_builtin(name, &object, Builtin, false);
        let int = leaf("int");
        let bool = TypeObject::new_builtin("bool", &int, Builtin, false);

        let base_exception = TypeObject::new_builtin("BaseException", &object, Exception, true);
        let exc = |name: &str, base: &Arc<TypeObject>| {
            TypeObject::new_builtin(name, base, Exception, true)
        };
        let exception = exc("Exception", &base_exception);
        let runtime_error = exc("RuntimeError", &exception);
        let name_error = exc("NameError", &exception);
        let lookup_error = exc("LookupError", &exception);
        let arithmetic_error = exc("ArithmeticError", &exception);

        Self {
            type_: TypeObject::new_builtin("type", &object, Plain, false),
            none_type: leaf("NoneType"),
            float: leaf("float"),
            str: leaf("str"),
            tuple: leaf("tuple"),
            list: leaf("list"),
            dict: leaf("dict"),
            function: leaf("function"),
            builtin_function: leaf("builtin_function_or_method"),
            method: leaf("method"),
            property: leaf("property"),
            staticmethod: leaf("staticmethod"),
            code: leaf("code"),
            module: leaf("module"),
            lazy_import: leaf("lazy_import"),
            frame: leaf("frame"),
            iterator: leaf("iterator"),
            generator: leaf("generator"),
            coroutine: leaf("coroutine"),
            async_generator: leaf("async_generator"),
            async_gen_awaitable: leaf("async_generator_asend"),
            int,
            bool,

            generator_exit: exc("GeneratorExit", &base_exception),
            type_error: exc("TypeError", &exception),
            value_error: exc("ValueError", &exception),
            attribute_error: exc("AttributeError", &exception),
            import_error: exc("ImportError", &exception),
            assertion_error: exc("AssertionError", &exception),
            stop_iteration: exc("StopIteration", &exception),
            stop_async_iteration: exc("StopAsyncIteration", &exception),
            recursion_error: exc("RecursionError", &runtime_error),
            not_implemented_error: exc("NotImplementedError", &runtime_error),
            unbound_local_error: exc("UnboundLocalError", &name_error),
            key_error: exc("KeyError", &lookup_error),
            index_error: exc("IndexError", &lookup_error),
            zero_division_error: exc("ZeroDivisionError", &arithmetic_error),
            overflow_error: exc("OverflowError", &arithmetic_error),
            runtime_error,
            name_error,
            lookup_error,
            arithmetic_error,
            exception,
            base_exception,
            object,
        }
    }

    /// Types bound by name in the builtins namespace.
    pub fn named(&self) -> Vec<&Arc<TypeObject>> {
        vec![
            &self.object,
            &self.type_,
            &self.int,
            &self.bool,
            &self.float,
            &self.str,
            &self.tuple,
            &self.list,
            &self.dict,
            &self.property,
            &self.staticmethod,
            &self.base_exception,
            &self.generator_exit,
            &self.exception,
            &self.type_error,
            &self.value_error,
            &self.attribute_error,
            &self.import_error,
            &self.assertion_error,
            &self.stop_iteration,
            &self.stop_async_iteration,
            &self.runtime_error,
            &self.recursion_error,
            &self.not_implemented_error,
            &self.name_error,
            &self.unbound_local_error,
            &self.lookup_error,
            &self.key_error,
            &self.index_error,
            &self.arithmetic_error,
            &self.zero_division_error,
            &self.overflow_error,
        ]
    }
}

static BUILTIN_TYPES: OnceLock<BuiltinTypes> = OnceLock::new();

/// The process-wide builtin types.
#[inline]
pub fn builtin_types() -> &'static BuiltinTypes {
    BUILTIN_TYPES.get_or_init(BuiltinTypes::build)
}
