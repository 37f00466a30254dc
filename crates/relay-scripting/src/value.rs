//! The value model shared by every runtime instance.
//!
//! Values are either primitives (passed between runtimes by copy) or
//! reference types with pointer identity (objects, callables, proxies,
//! async cells, host-context handles). `ScriptValue` is `Send + Sync`
//! because values routinely cross the worker/main-thread boundary inside
//! trampolines and outcome slots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::asyncresult::AsyncResult;
use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::host::ContextHandle;
use crate::proxy::{CallProxy, DelegateProxy, ObjectProxy};

/// Arguments to a script-visible call: positional values plus keywords.
#[derive(Clone, Debug, Default)]
pub struct CallArgs {
    pub args: Vec<ScriptValue>,
    pub kwargs: BTreeMap<String, ScriptValue>,
}

impl CallArgs {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<ScriptValue>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&ScriptValue> {
        self.args.get(index)
    }

    /// Positional argument that must be present, by operation name for the
    /// error message.
    pub fn required(&self, index: usize, op: &str) -> ScriptResult<&ScriptValue> {
        self.args.get(index).ok_or_else(|| {
            ScriptError::bad_argument(format!("{op}: missing argument {}", index + 1))
        })
    }

    pub fn str_arg(&self, index: usize, op: &str) -> ScriptResult<&str> {
        match self.required(index, op)? {
            ScriptValue::Str(s) => Ok(s),
            other => Err(ScriptError::bad_argument(format!(
                "{op}: argument {} must be a string, got {}",
                index + 1,
                other.type_name()
            ))),
        }
    }

    pub fn int_arg(&self, index: usize, op: &str) -> ScriptResult<i64> {
        match self.required(index, op)? {
            ScriptValue::Int(n) => Ok(*n),
            ScriptValue::Bool(b) => Ok(i64::from(*b)),
            other => Err(ScriptError::bad_argument(format!(
                "{op}: argument {} must be an integer, got {}",
                index + 1,
                other.type_name()
            ))),
        }
    }

    /// Optional integer, positional or by keyword.
    pub fn opt_int(&self, index: usize, key: &str, op: &str) -> ScriptResult<Option<i64>> {
        let slot = self.args.get(index).or_else(|| self.kwargs.get(key));
        match slot {
            None | Some(ScriptValue::Null) => Ok(None),
            Some(ScriptValue::Int(n)) => Ok(Some(*n)),
            Some(other) => Err(ScriptError::bad_argument(format!(
                "{op}: {key} must be an integer, got {}",
                other.type_name()
            ))),
        }
    }

    /// Optional string, positional or by keyword; `Null` counts as absent.
    pub fn opt_str(&self, index: usize, key: &str, op: &str) -> ScriptResult<Option<String>> {
        let slot = self.args.get(index).or_else(|| self.kwargs.get(key));
        match slot {
            None | Some(ScriptValue::Null) => Ok(None),
            Some(ScriptValue::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ScriptError::bad_argument(format!(
                "{op}: {key} must be a string, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn callable_arg(&self, index: usize, op: &str) -> ScriptResult<CallableRef> {
        match self.required(index, op)? {
            ScriptValue::Callable(c) => Ok(c.clone()),
            other => Err(ScriptError::bad_argument(format!(
                "{op}: argument {} must be callable, got {}",
                index + 1,
                other.type_name()
            ))),
        }
    }
}

type CallableFn = dyn Fn(CallArgs) -> ScriptResult<ScriptValue> + Send + Sync;

/// A callable value. Cloning shares the underlying function, so identity
/// (`id`) is stable across clones.
#[derive(Clone)]
pub struct CallableRef(Arc<CallableFn>);

impl CallableRef {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(CallArgs) -> ScriptResult<ScriptValue> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        (self.0)(args)
    }

    /// Pointer identity of the shared function.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::fmt::Debug for CallableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallableRef({:#x})", self.id())
    }
}

struct ObjectInner {
    class: &'static str,
    attrs: Mutex<BTreeMap<String, ScriptValue>>,
}

/// A mutable attribute bag with pointer identity, the reference type that
/// object-proxies wrap across runtimes.
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectInner>);

impl ObjectRef {
    pub fn new(class: &'static str) -> Self {
        Self(Arc::new(ObjectInner {
            class,
            attrs: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn class(&self) -> &'static str {
        self.0.class
    }

    pub fn get(&self, name: &str) -> Option<ScriptValue> {
        self.0.attrs.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: ScriptValue) {
        self.0.attrs.lock().insert(name.into(), value);
    }

    /// Builder-style set, for assembling method tables.
    pub fn with(self, name: impl Into<String>, value: ScriptValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.0.attrs.lock().keys().cloned().collect()
    }

    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#x})", self.0.class, self.id())
    }
}

/// Any value a script-visible operation can produce or consume.
#[derive(Clone, Debug)]
pub enum ScriptValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<ScriptValue>),
    Object(ObjectRef),
    Callable(CallableRef),
    Context(ContextHandle),
    ObjectProxy(Arc<ObjectProxy>),
    CallProxy(Arc<CallProxy>),
    DelegateProxy(Arc<DelegateProxy>),
    AsyncResult(Arc<AsyncResult>),
}

impl ScriptValue {
    pub fn str(s: impl Into<String>) -> Self {
        ScriptValue::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "bool",
            ScriptValue::Int(_) => "int",
            ScriptValue::Float(_) => "float",
            ScriptValue::Str(_) => "string",
            ScriptValue::Bytes(_) => "bytes",
            ScriptValue::List(_) => "list",
            ScriptValue::Object(_) => "object",
            ScriptValue::Callable(_) => "callable",
            ScriptValue::Context(_) => "context",
            ScriptValue::ObjectProxy(_) => "object-proxy",
            ScriptValue::CallProxy(_) => "call-proxy",
            ScriptValue::DelegateProxy(_) => "delegate-proxy",
            ScriptValue::AsyncResult(_) => "async-result",
        }
    }

    /// The sole decision point for "cross by copy" vs "cross by proxy".
    ///
    /// Lists count as primitive here: they are owned values in this model,
    /// crossing runtimes as copies rather than shared references. Context
    /// handles are plain identities and also cross by copy; their proxy
    /// wrapping is the delegate's job, not the marshaller's.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ScriptValue::Null
                | ScriptValue::Bool(_)
                | ScriptValue::Int(_)
                | ScriptValue::Float(_)
                | ScriptValue::Str(_)
                | ScriptValue::Bytes(_)
                | ScriptValue::List(_)
                | ScriptValue::Context(_)
        )
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(n) => *n != 0,
            ScriptValue::Float(x) => *x != 0.0,
            ScriptValue::Str(s) => !s.is_empty(),
            ScriptValue::Bytes(b) => !b.is_empty(),
            ScriptValue::List(items) => !items.is_empty(),
            _ => true,
        }
    }

    /// Pointer identity for reference types; `None` for value types.
    pub fn identity(&self) -> Option<usize> {
        match self {
            ScriptValue::Object(o) => Some(o.id()),
            ScriptValue::Callable(c) => Some(c.id()),
            ScriptValue::ObjectProxy(p) => Some(Arc::as_ptr(p) as *const () as usize),
            ScriptValue::CallProxy(p) => Some(Arc::as_ptr(p) as *const () as usize),
            ScriptValue::DelegateProxy(p) => Some(Arc::as_ptr(p) as *const () as usize),
            ScriptValue::AsyncResult(a) => Some(Arc::as_ptr(a) as *const () as usize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> ScriptResult<&str> {
        match self {
            ScriptValue::Str(s) => Ok(s),
            other => Err(ScriptError::bad_argument(format!(
                "expected a string, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_context(&self) -> ScriptResult<ContextHandle> {
        match self {
            ScriptValue::Context(handle) => Ok(*handle),
            // A delegate-wrapped context unwraps back to its handle.
            ScriptValue::DelegateProxy(p) => match p.unwrapped() {
                Some(ScriptValue::Context(handle)) => Ok(handle),
                _ => Err(ScriptError::bad_argument(
                    "expected a context, got a delegate over something else",
                )),
            },
            other => Err(ScriptError::bad_argument(format!(
                "expected a context, got {}",
                other.type_name()
            ))),
        }
    }

    /// Call the value if it is callable in any of its forms.
    pub fn invoke(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        match self {
            ScriptValue::Callable(c) => c.call(args),
            ScriptValue::CallProxy(p) => p.call(args),
            ScriptValue::DelegateProxy(p) => p.call(args),
            ScriptValue::ObjectProxy(p) => p.call(args),
            other => Err(ScriptError::new(
                ErrorKind::UnsupportedOperation,
                format!("{} is not callable", other.type_name()),
            )),
        }
    }

    /// Debug rendering shown in chat-buffer error reports.
    pub fn repr(&self) -> String {
        match self {
            ScriptValue::Null => "null".to_string(),
            ScriptValue::Bool(b) => b.to_string(),
            ScriptValue::Int(n) => n.to_string(),
            ScriptValue::Float(x) => x.to_string(),
            ScriptValue::Str(s) => format!("{s:?}"),
            ScriptValue::Bytes(b) => format!("bytes[{}]", b.len()),
            ScriptValue::List(items) => {
                let inner: Vec<String> = items.iter().map(ScriptValue::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            ScriptValue::Object(o) => format!("{o:?}"),
            ScriptValue::Callable(c) => format!("{c:?}"),
            ScriptValue::Context(h) => format!("Context({:#x})", h.0),
            ScriptValue::ObjectProxy(p) => p.repr(),
            ScriptValue::CallProxy(p) => p.repr(),
            ScriptValue::DelegateProxy(p) => p.repr(),
            ScriptValue::AsyncResult(_) => "AsyncResult".to_string(),
        }
    }
}

impl PartialEq for ScriptValue {
    /// Primitives compare by value, reference types by identity. A context
    /// handle equals another binding of the same underlying host context.
    fn eq(&self, other: &Self) -> bool {
        use ScriptValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Context(a), Context(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(n: i64) -> Self {
        ScriptValue::Int(n)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::Str(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::Str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_compare_by_value() {
        assert_eq!(ScriptValue::Int(3), ScriptValue::Int(3));
        assert_eq!(ScriptValue::str("a"), ScriptValue::str("a"));
        assert_ne!(ScriptValue::Int(3), ScriptValue::str("3"));
    }

    #[test]
    fn objects_compare_by_identity() {
        let a = ObjectRef::new("Thing");
        let b = ObjectRef::new("Thing");
        assert_eq!(ScriptValue::Object(a.clone()), ScriptValue::Object(a.clone()));
        assert_ne!(ScriptValue::Object(a), ScriptValue::Object(b));
    }

    #[test]
    fn callable_identity_survives_clone() {
        let c = CallableRef::new(|_| Ok(ScriptValue::Null));
        let d = c.clone();
        assert_eq!(c.id(), d.id());
    }

    #[test]
    fn primitive_partition() {
        assert!(ScriptValue::Null.is_primitive());
        assert!(ScriptValue::str("x").is_primitive());
        assert!(ScriptValue::List(vec![ScriptValue::Int(1)]).is_primitive());
        assert!(ScriptValue::Context(ContextHandle(7)).is_primitive());
        assert!(!ScriptValue::Object(ObjectRef::new("Thing")).is_primitive());
        assert!(!ScriptValue::Callable(CallableRef::new(|_| Ok(ScriptValue::Null))).is_primitive());
    }

    #[test]
    fn object_attrs_round_trip() {
        let o = ObjectRef::new("Config");
        o.set("level", ScriptValue::Int(4));
        assert_eq!(o.get("level"), Some(ScriptValue::Int(4)));
        assert_eq!(o.get("missing"), None);
        assert_eq!(o.attr_names(), vec!["level".to_string()]);
    }

    #[test]
    fn str_arg_rejects_wrong_type() {
        let args = CallArgs::positional(vec![ScriptValue::Int(1)]);
        let err = args.str_arg(0, "command").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BadArgument);
    }

    #[test]
    fn truthiness_matches_scripting_conventions() {
        assert!(!ScriptValue::Null.is_truthy());
        assert!(!ScriptValue::Int(0).is_truthy());
        assert!(ScriptValue::Int(-1).is_truthy());
        assert!(!ScriptValue::str("").is_truthy());
        assert!(ScriptValue::List(vec![ScriptValue::Null]).is_truthy());
    }
}
