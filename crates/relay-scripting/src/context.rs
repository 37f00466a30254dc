//! Bindings to the host's context objects (server/channel/query buffers).
//!
//! A binding holds nothing but the context's opaque handle; operations on
//! it follow one pattern: capture the host's current context, switch to
//! the bound one, do the work, switch back. The restore rides an RAII
//! guard so an error mid-operation cannot leave the host pointed at the
//! wrong buffer. Two bindings are equal iff their handles are.

use std::sync::Arc;

use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::host::{ContextHandle, EventAttrs, HostApi, InfoValue};
use crate::listiter::{ListIter, read_list};
use crate::proxy::{DelegateProxy, ProxyTarget};
use crate::runtime::{Registry, RuntimeToken, main_thread_check};
use crate::value::{CallArgs, CallableRef, ObjectRef, ScriptValue};

/// Switch-and-restore guard over the host's context selection.
pub(crate) struct Selected<'h> {
    host: &'h dyn HostApi,
    prior: ContextHandle,
}

pub(crate) fn select(host: &dyn HostApi, target: ContextHandle) -> ScriptResult<Selected<'_>> {
    let prior = host.get_context();
    if !host.set_context(target) {
        return Err(ScriptError::new(
            ErrorKind::ContextResolution,
            "context no longer exists",
        ));
    }
    Ok(Selected { host, prior })
}

impl Drop for Selected<'_> {
    fn drop(&mut self) {
        self.host.set_context(self.prior);
    }
}

#[derive(Clone)]
pub struct Context {
    handle: ContextHandle,
    host: Arc<dyn HostApi>,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
}

impl Context {
    pub fn new(
        handle: ContextHandle,
        host: Arc<dyn HostApi>,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
    ) -> Self {
        Self {
            handle,
            host,
            registry,
            runtime,
        }
    }

    /// Look a context up by network and/or channel name.
    pub fn find(
        network: Option<&str>,
        channel: Option<&str>,
        host: Arc<dyn HostApi>,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
    ) -> ScriptResult<Option<Self>> {
        main_thread_check("find_context")?;
        Ok(host
            .find_context(network, channel)
            .map(|handle| Self::new(handle, host, registry, runtime)))
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Make this the host's current context, with no restore. This is the
    /// one deliberate exception to the switch-and-restore pattern.
    pub fn set(&self) -> ScriptResult<()> {
        main_thread_check("context.set")?;
        if self.host.set_context(self.handle) {
            Ok(())
        } else {
            Err(ScriptError::new(
                ErrorKind::ContextResolution,
                "context no longer exists",
            ))
        }
    }

    pub fn prnt(&self, text: &str) -> ScriptResult<()> {
        main_thread_check("context.prnt")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        self.host.print(text);
        Ok(())
    }

    pub fn command(&self, text: &str) -> ScriptResult<()> {
        main_thread_check("context.command")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        self.host.command(text);
        Ok(())
    }

    pub fn emit_print(
        &self,
        event: &str,
        args: &[String],
        attrs: Option<&EventAttrs>,
    ) -> ScriptResult<()> {
        main_thread_check("context.emit_print")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        if self.host.emit_print(event, args, attrs) {
            Ok(())
        } else {
            Err(ScriptError::bad_argument(format!(
                "no text event named {event:?}"
            )))
        }
    }

    pub fn get_info(&self, id: &str) -> ScriptResult<ScriptValue> {
        main_thread_check("context.get_info")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        match self.host.get_info(id) {
            Some(InfoValue::Str(s)) => Ok(ScriptValue::Str(s)),
            Some(InfoValue::Ptr(p)) => Ok(ScriptValue::Int(p as i64)),
            None => Err(ScriptError::bad_argument(format!("unknown info id {id:?}"))),
        }
    }

    pub fn get_list(&self, name: &str) -> ScriptResult<Vec<ObjectRef>> {
        main_thread_check("context.get_list")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        read_list(
            Arc::clone(&self.host),
            &self.registry,
            self.runtime,
            name,
        )
    }

    pub fn get_listiter(&self, name: &str) -> ScriptResult<ListIter> {
        main_thread_check("context.get_listiter")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        ListIter::open(Arc::clone(&self.host), &self.registry, self.runtime, name)
    }

    pub fn network(&self) -> ScriptResult<String> {
        self.info_string("network")
    }

    pub fn channel(&self) -> ScriptResult<String> {
        self.info_string("channel")
    }

    fn info_string(&self, id: &str) -> ScriptResult<String> {
        main_thread_check("context attribute")?;
        let _sel = select(self.host.as_ref(), self.handle)?;
        match self.host.get_info(id) {
            Some(InfoValue::Str(s)) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    pub fn describe(&self) -> String {
        match (self.network(), self.channel()) {
            (Ok(network), Ok(channel)) => {
                format!("<Context {network:?} {channel:?}>")
            }
            _ => format!("<Context {:#x} (gone)>", self.handle.0),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

/// Delegate-proxy target over a context binding. Method callables are
/// built once so repeated attribute reads hand back the same delegates;
/// `network` and `channel` are computed on access.
struct ContextTarget {
    ctx: Context,
    methods: ObjectRef,
}

impl ContextTarget {
    fn new(ctx: Context) -> Self {
        let methods = ObjectRef::new("Context");

        let c = ctx.clone();
        methods.set(
            "set",
            ScriptValue::Callable(CallableRef::new(move |_| {
                c.set()?;
                Ok(ScriptValue::Null)
            })),
        );

        let c = ctx.clone();
        methods.set(
            "prnt",
            ScriptValue::Callable(CallableRef::new(move |args| {
                c.prnt(args.str_arg(0, "prnt")?)?;
                Ok(ScriptValue::Null)
            })),
        );

        let c = ctx.clone();
        methods.set(
            "command",
            ScriptValue::Callable(CallableRef::new(move |args| {
                c.command(args.str_arg(0, "command")?)?;
                Ok(ScriptValue::Null)
            })),
        );

        let c = ctx.clone();
        methods.set(
            "emit_print",
            ScriptValue::Callable(CallableRef::new(move |args| {
                let event = args.str_arg(0, "emit_print")?;
                let rest = collect_string_args(&args, 1, "emit_print")?;
                c.emit_print(event, &rest, None)?;
                Ok(ScriptValue::Null)
            })),
        );

        let c = ctx.clone();
        methods.set(
            "get_info",
            ScriptValue::Callable(CallableRef::new(move |args| {
                c.get_info(args.str_arg(0, "get_info")?)
            })),
        );

        let c = ctx.clone();
        methods.set(
            "get_list",
            ScriptValue::Callable(CallableRef::new(move |args| {
                let rows = c.get_list(args.str_arg(0, "get_list")?)?;
                Ok(ScriptValue::List(
                    rows.into_iter().map(ScriptValue::Object).collect(),
                ))
            })),
        );

        let c = ctx.clone();
        methods.set(
            "get_listiter",
            ScriptValue::Callable(CallableRef::new(move |args| {
                let iter = c.get_listiter(args.str_arg(0, "get_listiter")?)?;
                Ok(ScriptValue::Object(iter.into_object()))
            })),
        );

        Self { ctx, methods }
    }
}

pub(crate) fn collect_string_args(
    args: &CallArgs,
    from: usize,
    op: &str,
) -> ScriptResult<Vec<String>> {
    (from..args.args.len())
        .map(|i| args.str_arg(i, op).map(str::to_string))
        .collect()
}

impl ProxyTarget for ContextTarget {
    fn attr(&self, name: &str) -> ScriptResult<ScriptValue> {
        match name {
            "network" => Ok(ScriptValue::Str(self.ctx.network()?)),
            "channel" => Ok(ScriptValue::Str(self.ctx.channel()?)),
            _ => self.methods.get(name).ok_or_else(|| {
                ScriptError::new(
                    ErrorKind::UnknownField,
                    format!("context has no attribute {name:?}"),
                )
            }),
        }
    }

    fn set_attr(&self, name: &str, _value: ScriptValue) -> ScriptResult<()> {
        Err(ScriptError::unsupported(format!(
            "context attribute {name:?} is read-only"
        )))
    }

    fn attr_names(&self) -> Vec<String> {
        let mut names = vec!["network".to_string(), "channel".to_string()];
        names.extend(self.methods.attr_names());
        names
    }

    fn repr(&self) -> String {
        format!("Context({:#x})", self.ctx.handle().0)
    }

    fn identity(&self) -> usize {
        // Handle identity, so two wrappers of one context compare equal.
        self.ctx.handle().0 as usize
    }

    fn as_value(&self) -> Option<ScriptValue> {
        Some(ScriptValue::Context(self.ctx.handle()))
    }
}

/// Rebind a bare context handle as a delegate proxy of the given flavor,
/// usable from any thread.
pub fn wrap_context(
    handle: ContextHandle,
    is_async: bool,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
    host: Arc<dyn HostApi>,
) -> ScriptValue {
    let ctx = Context::new(handle, host.clone(), Arc::clone(&registry), runtime);
    let target = Arc::new(ContextTarget::new(ctx));
    ScriptValue::DelegateProxy(DelegateProxy::new(target, is_async, registry, runtime, host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn ctx_for(fx: &Fixture, handle: ContextHandle) -> Context {
        Context::new(
            handle,
            fx.host_dyn(),
            Arc::clone(&fx.registry),
            fx.registry.root(),
        )
    }

    #[test]
    fn print_lands_in_the_bound_context_and_selection_is_restored() {
        let fx = Fixture::new();
        let other = fx.host.add_context("libera", "#other");
        let home = fx.host.get_context();

        let ctx = ctx_for(&fx, other);
        ctx.prnt("hello there").unwrap();

        assert_eq!(fx.host.transcript(other), vec!["hello there".to_string()]);
        assert!(fx.host.transcript(home).is_empty());
        assert_eq!(fx.host.get_context(), home);
    }

    #[test]
    fn set_switches_without_restoring() {
        let fx = Fixture::new();
        let other = fx.host.add_context("libera", "#other");
        let ctx = ctx_for(&fx, other);
        ctx.set().unwrap();
        assert_eq!(fx.host.get_context(), other);
    }

    #[test]
    fn stale_context_is_a_resolution_error() {
        let fx = Fixture::new();
        let stale = ContextHandle(0xdead);
        let ctx = ctx_for(&fx, stale);
        let err = ctx.prnt("x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextResolution);
        let err = ctx.set().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextResolution);
    }

    #[test]
    fn network_and_channel_read_through_the_selection() {
        let fx = Fixture::new();
        let other = fx.host.add_context("oftc", "#odd");
        let ctx = ctx_for(&fx, other);
        assert_eq!(ctx.network().unwrap(), "oftc");
        assert_eq!(ctx.channel().unwrap(), "#odd");
    }

    #[test]
    fn find_resolves_by_network_and_channel() {
        let fx = Fixture::new();
        let wanted = fx.host.add_context("libera", "#findme");
        let found = Context::find(
            Some("libera"),
            Some("#findme"),
            fx.host_dyn(),
            Arc::clone(&fx.registry),
            fx.registry.root(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(found.handle(), wanted);

        let missing = Context::find(
            Some("libera"),
            Some("#nowhere"),
            fx.host_dyn(),
            Arc::clone(&fx.registry),
            fx.registry.root(),
        )
        .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn bindings_compare_by_handle() {
        let fx = Fixture::new();
        let h = fx.host.add_context("libera", "#eq");
        let a = ctx_for(&fx, h);
        let b = ctx_for(&fx, h);
        assert_eq!(a, b);
    }

    #[test]
    fn wrapped_context_exposes_methods_as_delegates() {
        let fx = Fixture::new();
        let h = fx.host.add_context("libera", "#wrap");
        let wrapped = wrap_context(
            h,
            false,
            Arc::clone(&fx.registry),
            fx.registry.root(),
            fx.host_dyn(),
        );
        let ScriptValue::DelegateProxy(proxy) = wrapped else {
            panic!("expected a delegate proxy");
        };

        assert_eq!(proxy.getattr("channel").unwrap(), ScriptValue::str("#wrap"));
        let prnt = proxy.getattr("prnt").unwrap();
        prnt.invoke(CallArgs::positional(vec![ScriptValue::str("via proxy")]))
            .unwrap();
        assert_eq!(fx.host.transcript(h), vec!["via proxy".to_string()]);

        // Same attribute, same delegate.
        let again = proxy.getattr("prnt").unwrap();
        assert_eq!(prnt, again);
    }

    #[test]
    fn wrapped_context_unwraps_to_its_handle() {
        let fx = Fixture::new();
        let h = fx.host.add_context("libera", "#unwrap");
        let wrapped = wrap_context(
            h,
            true,
            Arc::clone(&fx.registry),
            fx.registry.root(),
            fx.host_dyn(),
        );
        assert_eq!(wrapped.as_context().unwrap(), h);
    }
}
