//! Cross-runtime and cross-thread wrappers.
//!
//! Two distinct concerns share the wrapping machinery. Object-proxies and
//! call-proxies carry references *between runtimes*: touching the wrapped
//! value activates the owning runtime first, so a plugin can hold an
//! object another plugin produced. Delegate-proxies carry a surface
//! *between threads*: attribute reads pass through, but every callable
//! attribute comes back wrapped in a [`Delegate`] that reroutes the call
//! onto the main thread.
//!
//! Wrapping is identity-cached: asking for the same attribute twice yields
//! the same wrapper, so scripts can compare and unhook what they hooked.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::delegate::Delegate;
use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::host::HostApi;
use crate::runtime::{Registry, RuntimeToken};
use crate::value::{CallArgs, CallableRef, ObjectRef, ScriptValue};

/// Wrap a value produced by runtime `owner` for use outside it.
///
/// Primitives cross by copy; existing wrappers are never re-wrapped, which
/// keeps chains from building up when values bounce between runtimes.
pub fn wrap_for_outside(
    value: ScriptValue,
    owner: RuntimeToken,
    registry: &Arc<Registry>,
) -> ScriptValue {
    if value.is_primitive() {
        return value;
    }
    match value {
        ScriptValue::Callable(c) => {
            ScriptValue::CallProxy(Arc::new(CallProxy::new(c, owner, Arc::clone(registry))))
        }
        ScriptValue::Object(_) => {
            ScriptValue::ObjectProxy(ObjectProxy::new(value, owner, Arc::clone(registry)))
        }
        other => other,
    }
}

/// A reference into another runtime. Attribute traffic activates the
/// owning runtime for the duration of the access.
pub struct ObjectProxy {
    wrapped: ScriptValue,
    owner: RuntimeToken,
    registry: Arc<Registry>,
    cache: Mutex<HashMap<usize, ScriptValue>>,
}

impl ObjectProxy {
    pub fn new(wrapped: ScriptValue, owner: RuntimeToken, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            wrapped,
            owner,
            registry,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The wrapped value itself, unproxied.
    pub fn unwrapped(&self) -> ScriptValue {
        self.wrapped.clone()
    }

    pub fn owner(&self) -> RuntimeToken {
        self.owner
    }

    pub fn getattr(&self, name: &str) -> ScriptResult<ScriptValue> {
        if name == "obj" {
            return Ok(self.wrapped.clone());
        }
        let attr = {
            let _active = self.registry.activate(self.owner)?;
            self.raw_attr(name)?
        };
        if attr.is_primitive() {
            return Ok(attr);
        }
        let Some(key) = attr.identity() else {
            return Ok(attr);
        };
        let mut cache = self.cache.lock();
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        let wrapped = wrap_for_outside(attr, self.owner, &self.registry);
        cache.insert(key, wrapped.clone());
        Ok(wrapped)
    }

    pub fn setattr(&self, name: &str, value: ScriptValue) -> ScriptResult<()> {
        if matches!(value, ScriptValue::Object(_)) {
            return Err(ScriptError::unsupported(
                "cannot assign a foreign object through a proxy; pass primitives or callables",
            ));
        }
        let _active = self.registry.activate(self.owner)?;
        match &self.wrapped {
            ScriptValue::Object(o) => {
                o.set(name, value);
                Ok(())
            }
            other => Err(ScriptError::unsupported(format!(
                "{} has no settable attributes",
                other.type_name()
            ))),
        }
    }

    /// Invoke the wrapped value. Arguments from the calling runtime are
    /// pre-wrapped over it before the owning runtime activates, so the
    /// callee sees proxies rather than raw foreign references.
    pub fn call(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        let caller = self.registry.active().unwrap_or_else(|| self.registry.root());
        let args = wrap_args(args, caller, &self.registry);
        let result = {
            let _active = self.registry.activate(self.owner)?;
            self.wrapped
                .invoke(args)
                .map_err(|err| err.with_frame(format!("proxied call into runtime {}", self.owner)))?
        };
        Ok(wrap_for_outside(result, self.owner, &self.registry))
    }

    pub fn dir(&self) -> ScriptResult<Vec<String>> {
        let _active = self.registry.activate(self.owner)?;
        let mut names = vec!["obj".to_string()];
        if let ScriptValue::Object(o) = &self.wrapped {
            names.extend(o.attr_names());
        }
        Ok(names)
    }

    pub fn repr(&self) -> String {
        format!("<ObjectProxy of {} in runtime {}>", self.wrapped.repr(), self.owner)
    }

    /// Equality follows the wrapped value, so a proxy equals its peer
    /// wrapping the same reference.
    pub fn proxy_eq(&self, other: &ScriptValue) -> bool {
        match other {
            ScriptValue::ObjectProxy(p) => self.wrapped == p.wrapped,
            other => self.wrapped == *other,
        }
    }

    fn raw_attr(&self, name: &str) -> ScriptResult<ScriptValue> {
        match &self.wrapped {
            ScriptValue::Object(o) => o.get(name).ok_or_else(|| {
                ScriptError::new(
                    ErrorKind::UnknownField,
                    format!("{} has no attribute {name:?}", o.class()),
                )
            }),
            other => Err(ScriptError::unsupported(format!(
                "{} has no attributes",
                other.type_name()
            ))),
        }
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

/// A callable from another runtime. Invoking it activates the owner for
/// the duration of the call and marshals any error back to the caller.
pub struct CallProxy {
    callable: CallableRef,
    owner: RuntimeToken,
    registry: Arc<Registry>,
}

impl CallProxy {
    pub fn new(callable: CallableRef, owner: RuntimeToken, registry: Arc<Registry>) -> Self {
        Self {
            callable,
            owner,
            registry,
        }
    }

    pub fn owner(&self) -> RuntimeToken {
        self.owner
    }

    pub fn call(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        let caller = self.registry.active().unwrap_or_else(|| self.registry.root());
        let args = wrap_args(args, caller, &self.registry);
        let result = {
            let _active = self.registry.activate(self.owner)?;
            self.callable
                .call(args)
                .map_err(|err| err.with_frame(format!("proxied call into runtime {}", self.owner)))?
        };
        Ok(wrap_for_outside(result, self.owner, &self.registry))
    }

    pub fn repr(&self) -> String {
        format!("<CallProxy into runtime {}>", self.owner)
    }
}

impl std::fmt::Debug for CallProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

fn wrap_args(mut args: CallArgs, caller: RuntimeToken, registry: &Arc<Registry>) -> CallArgs {
    for slot in args.args.iter_mut() {
        let value = std::mem::replace(slot, ScriptValue::Null);
        *slot = wrap_for_outside(value, caller, registry);
    }
    for slot in args.kwargs.values_mut() {
        let value = std::mem::replace(slot, ScriptValue::Null);
        *slot = wrap_for_outside(value, caller, registry);
    }
    args
}

/// What a delegate-proxy fronts: a named set of attributes, some of them
/// callable. Implemented by plain objects and by host-context bindings,
/// whose `network`/`channel` attributes are computed on access.
pub trait ProxyTarget: Send + Sync {
    fn attr(&self, name: &str) -> ScriptResult<ScriptValue>;
    fn set_attr(&self, name: &str, value: ScriptValue) -> ScriptResult<()>;
    fn attr_names(&self) -> Vec<String>;
    fn repr(&self) -> String;
    fn identity(&self) -> usize;
    /// The underlying value, when one exists (`obj` attribute).
    fn as_value(&self) -> Option<ScriptValue>;
}

impl ProxyTarget for ObjectRef {
    fn attr(&self, name: &str) -> ScriptResult<ScriptValue> {
        self.get(name).ok_or_else(|| {
            ScriptError::new(
                ErrorKind::UnknownField,
                format!("{} has no attribute {name:?}", self.class()),
            )
        })
    }

    fn set_attr(&self, name: &str, value: ScriptValue) -> ScriptResult<()> {
        self.set(name, value);
        Ok(())
    }

    fn attr_names(&self) -> Vec<String> {
        ObjectRef::attr_names(self)
    }

    fn repr(&self) -> String {
        format!("{self:?}")
    }

    fn identity(&self) -> usize {
        self.id()
    }

    fn as_value(&self) -> Option<ScriptValue> {
        Some(ScriptValue::Object(self.clone()))
    }
}

/// A thread-safe front for a main-thread-only surface. Callable attributes
/// come back as delegates bound to the proxy's sync/async flavor; the rest
/// pass through.
pub struct DelegateProxy {
    target: Arc<dyn ProxyTarget>,
    is_async: bool,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
    host: Arc<dyn HostApi>,
    cache: Mutex<HashMap<usize, ScriptValue>>,
}

impl DelegateProxy {
    pub fn new(
        target: Arc<dyn ProxyTarget>,
        is_async: bool,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
        host: Arc<dyn HostApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            is_async,
            registry,
            runtime,
            host,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// The value behind the proxy, if the target has one.
    pub fn unwrapped(&self) -> Option<ScriptValue> {
        self.target.as_value()
    }

    pub fn getattr(&self, name: &str) -> ScriptResult<ScriptValue> {
        match name {
            "is_async" => return Ok(ScriptValue::Bool(self.is_async)),
            "obj" => {
                if let Some(value) = self.target.as_value() {
                    return Ok(value);
                }
            }
            _ => {}
        }
        let attr = self.target.attr(name)?;
        match attr {
            ScriptValue::Callable(callable) => {
                let key = callable.id();
                let mut cache = self.cache.lock();
                if let Some(hit) = cache.get(&key) {
                    return Ok(hit.clone());
                }
                let delegate = Delegate::with_name(
                    callable,
                    self.is_async,
                    name,
                    Arc::clone(&self.registry),
                    self.runtime,
                    Arc::clone(&self.host),
                );
                let wrapped =
                    ScriptValue::Callable(CallableRef::new(move |args| delegate.call(args)));
                cache.insert(key, wrapped.clone());
                Ok(wrapped)
            }
            other => Ok(other),
        }
    }

    pub fn setattr(&self, name: &str, value: ScriptValue) -> ScriptResult<()> {
        self.target.set_attr(name, value)
    }

    pub fn call(&self, _args: CallArgs) -> ScriptResult<ScriptValue> {
        Err(ScriptError::unsupported(format!(
            "{} is not callable; call one of its methods",
            self.repr()
        )))
    }

    pub fn dir(&self) -> Vec<String> {
        let mut names = vec!["is_async".to_string(), "obj".to_string()];
        names.extend(self.target.attr_names());
        names
    }

    pub fn repr(&self) -> String {
        let flavor = if self.is_async { "asynchronous" } else { "synchronous" };
        format!("<{flavor} delegate over {}>", self.target.repr())
    }

    /// Two delegate proxies are interchangeable when they front the same
    /// target with the same flavor.
    pub fn proxy_eq(&self, other: &DelegateProxy) -> bool {
        self.target.identity() == other.target.identity() && self.is_async == other.is_async
    }
}

impl std::fmt::Debug for DelegateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}
