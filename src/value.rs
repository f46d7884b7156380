// File: src/value.rs
//
// Runtime value model for the Canidae VM.
// A tagged enum covers the primitives; everything heap-shaped sits behind
// an Rc (with RefCell where the language allows mutation), so values on
// the operand stack stay cheap to clone.

use crate::bytecode::Chunk;
use crate::errors::RuntimeError;
use ahash::AHashMap;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

/// Signature shared by all native (host) functions.
pub type NativeImpl = fn(&[Value]) -> Result<Value, RuntimeError>;

/// A compiled function: one bytecode chunk plus call metadata.
///
/// The top-level script compiles to a `Function` with no name; imports give
/// each function the directory of its source file so nested `import`
/// statements resolve relative to the file that issued them.
#[derive(Debug)]
pub struct Function {
    pub name: Option<String>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub source_dir: Option<Rc<PathBuf>>,
}

impl Function {
    /// Descriptor used in stack traces: `script` or `name()`.
    pub fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("{}()", name),
            None => "script".to_string(),
        }
    }
}

/// A variable captured by a closure.
///
/// Open upvalues point at a live stack slot; when the owning frame (or
/// block) exits, the VM closes them by moving the value into the cell.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

/// A function paired with its captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        Self { function, upvalues: Vec::new() }
    }
}

/// A host function exposed to scripts. `arity: None` means variadic.
pub struct NativeFn {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub function: NativeImpl,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

/// A class: name, method table, and the superclass recorded at definition.
///
/// Methods are copied down from the superclass when `class Sub : Super`
/// executes, so lookup never walks a chain. The superclass link itself is
/// kept for `super` dispatch.
#[derive(Debug)]
pub struct Class {
    pub name: String,
    pub methods: RefCell<AHashMap<String, Rc<Closure>>>,
    pub superclass: RefCell<Option<Rc<Class>>>,
}

impl Class {
    pub fn new(name: String) -> Self {
        Self {
            name,
            methods: RefCell::new(AHashMap::new()),
            superclass: RefCell::new(None),
        }
    }
}

/// An instance: a class reference plus mutable named fields.
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<Class>,
    pub fields: AHashMap<String, Value>,
}

impl Instance {
    pub fn new(class: Rc<Class>) -> Self {
        Self { class, fields: AHashMap::new() }
    }
}

/// A method value bound to its receiver at property-access time.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

/// A category of exceptions. Catch clauses match against the type or any
/// ancestor through `parent`.
#[derive(Debug)]
pub struct ExceptionType {
    pub name: String,
    pub parent: Option<Rc<ExceptionType>>,
}

impl ExceptionType {
    /// True when this type is `other` or descends from it.
    pub fn is_a(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        let mut parent = self.parent.clone();
        while let Some(ty) = parent {
            if ty.name == name {
                return true;
            }
            parent = ty.parent.clone();
        }
        false
    }
}

/// A raised (or constructed) exception value.
#[derive(Debug)]
pub struct Exception {
    pub ty: Rc<ExceptionType>,
    pub message: String,
    pub attributes: RefCell<AHashMap<String, Value>>,
}

impl Exception {
    pub fn new(ty: Rc<ExceptionType>, message: String) -> Self {
        Self { ty, message, attributes: RefCell::new(AHashMap::new()) }
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<String>),
    Array(Rc<RefCell<Vec<Value>>>),
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Native(Rc<NativeFn>),
    Class(Rc<Class>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    ExceptionType(Rc<ExceptionType>),
    Exception(Rc<Exception>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Rc::new(s.into()))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// Only `null` and `false` are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    /// Short tag name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Function(_) | Value::Closure(_) | Value::BoundMethod(_) => "function",
            Value::Native(_) => "native function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::ExceptionType(_) => "errortype",
            Value::Exception(_) => "exception",
        }
    }
}

impl PartialEq for Value {
    /// Equality never errors: primitives compare structurally, strings by
    /// contents, and every heap object by identity. Mismatched tags are
    /// simply unequal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Format a number the way `print` does: integral values drop the decimal
/// point, everything else uses the shortest round-trip representation.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut seen = HashSet::new();
        write_value(f, self, &mut seen)
    }
}

/// Recursive formatter with cycle detection by array pointer identity, so a
/// self-referencing array prints as `[...]` instead of looping.
fn write_value(f: &mut fmt::Formatter<'_>, value: &Value, seen: &mut HashSet<usize>) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", format_number(*n)),
        Value::Str(s) => write!(f, "{}", s),
        Value::Array(elements) => {
            let ptr = Rc::as_ptr(elements) as usize;
            if !seen.insert(ptr) {
                return write!(f, "[...]");
            }
            write!(f, "[")?;
            for (i, element) in elements.borrow().iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write_value(f, element, seen)?;
            }
            seen.remove(&ptr);
            write!(f, "]")
        }
        Value::Function(fun) => match &fun.name {
            Some(name) => write!(f, "<function {}>", name),
            None => write!(f, "<script>"),
        },
        Value::Closure(closure) => match &closure.function.name {
            Some(name) => write!(f, "<function {}>", name),
            None => write!(f, "<script>"),
        },
        Value::BoundMethod(bound) => match &bound.method.function.name {
            Some(name) => write!(f, "<function {}>", name),
            None => write!(f, "<script>"),
        },
        Value::Native(native) => write!(f, "<native fn {}>", native.name),
        Value::Class(class) => write!(f, "<class {}>", class.name),
        Value::Instance(instance) => write!(f, "<{}>", instance.borrow().class.name),
        Value::ExceptionType(ty) => write!(f, "<errortype {}>", ty.name),
        Value::Exception(exc) => {
            if exc.message.is_empty() {
                write!(f, "<exception {}>", exc.ty.name)
            } else {
                write!(f, "<exception {}: {}>", exc.ty.name, exc.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numbers_print_without_trailing_zeros() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-4.0), "-4");
        assert_eq!(format_number(3125.0), "3125");
        assert!(format_number(23.0 / 6.0).starts_with("3.833"));
        assert!(format_number(-5.0 / 9.0).starts_with("-0.5555"));
    }

    #[test]
    fn array_repr_is_comma_space_separated() {
        let a = Value::array(vec![
            Value::Null,
            Value::Number(0.0),
            Value::string(""),
            Value::string("Hello"),
            Value::Bool(true),
        ]);
        assert_eq!(a.to_string(), "[null, 0, , Hello, true]");
    }

    #[test]
    fn self_referencing_array_does_not_recurse() {
        let inner = Rc::new(RefCell::new(vec![Value::Number(1.0)]));
        let a = Value::Array(inner.clone());
        inner.borrow_mut().push(a.clone());
        assert_eq!(a.to_string(), "[1, [...]]");
    }

    #[test]
    fn equality_is_total_and_never_errors() {
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_ne!(Value::Number(1.0), Value::string("1"));
        assert_ne!(Value::Null, Value::Bool(false));
        assert_eq!(Value::string("a"), Value::string("a"));

        let a = Value::array(vec![]);
        let b = Value::array(vec![]);
        assert_eq!(a, a.clone()); // identity
        assert_ne!(a, b); // equal contents, different objects
    }

    #[test]
    fn exception_type_ancestry() {
        let root = Rc::new(ExceptionType { name: "Error".to_string(), parent: None });
        let ty = ExceptionType { name: "TypeError".to_string(), parent: Some(root) };
        assert!(ty.is_a("TypeError"));
        assert!(ty.is_a("Error"));
        assert!(!ty.is_a("NameError"));
    }

    #[test]
    fn reprs_follow_the_angle_bracket_convention() {
        let class = Rc::new(Class::new("Mug".to_string()));
        assert_eq!(Value::Class(class.clone()).to_string(), "<class Mug>");
        let instance = Value::Instance(Rc::new(RefCell::new(Instance::new(class))));
        assert_eq!(instance.to_string(), "<Mug>");

        let root = Rc::new(ExceptionType { name: "TypeError".to_string(), parent: None });
        assert_eq!(Value::ExceptionType(root.clone()).to_string(), "<errortype TypeError>");
        let exc = Exception::new(root, "new exception".to_string());
        assert_eq!(
            Value::Exception(Rc::new(exc)).to_string(),
            "<exception TypeError: new exception>"
        );
    }
}
