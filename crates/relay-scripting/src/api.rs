//! The per-plugin API facade.
//!
//! One [`PluginApi`] exists per runtime instance. Its typed methods are
//! the embedding-facing surface; [`PluginApi::synchronous`] and
//! [`PluginApi::asynchronous`] project the same surface as delegate
//! proxies whose methods are safe to call from worker threads. Every
//! method verifies it is on the main thread first; the surrogates are the
//! sanctioned way around that.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::context::{Context, collect_string_args};
use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::events;
use crate::host::{EventAttrs, HookKind, HostApi, InfoValue, PrefValue};
use crate::listiter::{ListIter, read_list, schema_for};
use crate::proxy::{DelegateProxy, ProxyTarget};
use crate::runtime::{HookEntry, Registry, RuntimeToken, UnloadHook, main_thread_check};
use crate::value::{CallArgs, CallableRef, ObjectRef, ScriptValue};

pub const PRI_HIGHEST: i32 = 128;
pub const PRI_HIGH: i32 = 64;
pub const PRI_NORM: i32 = 0;
pub const PRI_LOW: i32 = -64;
pub const PRI_LOWEST: i32 = -128;

/// Flag bits for [`PluginApi::strip`].
pub const STRIP_COLORS: i64 = 1;
pub const STRIP_ATTRS: i64 = 2;
pub const STRIP_ALL: i64 = 3;

/// mIRC-style inline formatting codes.
pub const COLOR: &str = "\x03";
pub const BOLD: &str = "\x02";
pub const UNDERLINE: &str = "\x1f";
pub const ITALICS: &str = "\x1d";
pub const RESET: &str = "\x0f";
pub const BEEP: &str = "\x07";

/// A registration receipt; feed it back to [`PluginApi::unhook`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hook {
    pub id: u64,
}

pub struct PluginApi {
    host: Arc<dyn HostApi>,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
    plugin_name: String,
    surface: OnceLock<ObjectRef>,
    sync_surface: OnceLock<ScriptValue>,
    async_surface: OnceLock<ScriptValue>,
}

impl PluginApi {
    pub fn new(
        host: Arc<dyn HostApi>,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
    ) -> ScriptResult<Arc<Self>> {
        let state = registry.get(runtime).ok_or_else(ScriptError::runtime_gone)?;
        Ok(Arc::new(Self {
            host,
            registry,
            runtime,
            plugin_name: state.plugin_name.clone(),
            surface: OnceLock::new(),
            sync_surface: OnceLock::new(),
            async_surface: OnceLock::new(),
        }))
    }

    pub fn runtime(&self) -> RuntimeToken {
        self.runtime
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    // -- output and commands --

    pub fn prnt(&self, text: &str) -> ScriptResult<()> {
        main_thread_check("prnt")?;
        self.host.print(text);
        Ok(())
    }

    pub fn command(&self, text: &str) -> ScriptResult<()> {
        main_thread_check("command")?;
        self.host.command(text);
        Ok(())
    }

    pub fn emit_print(&self, event: &str, args: &[String]) -> ScriptResult<()> {
        main_thread_check("emit_print")?;
        if self.host.emit_print(event, args, None) {
            Ok(())
        } else {
            Err(ScriptError::bad_argument(format!(
                "no text event named {event:?}"
            )))
        }
    }

    pub fn emit_print_attrs(
        &self,
        attrs: &EventAttrs,
        event: &str,
        args: &[String],
    ) -> ScriptResult<()> {
        main_thread_check("emit_print_attrs")?;
        if self.host.emit_print(event, args, Some(attrs)) {
            Ok(())
        } else {
            Err(ScriptError::bad_argument(format!(
                "no text event named {event:?}"
            )))
        }
    }

    pub fn send_modes(
        &self,
        targets: &[String],
        modes_per_line: i32,
        sign: char,
        mode: char,
    ) -> ScriptResult<()> {
        main_thread_check("send_modes")?;
        self.host.send_modes(targets, modes_per_line, sign, mode);
        Ok(())
    }

    pub fn nickcmp(&self, a: &str, b: &str) -> ScriptResult<i32> {
        main_thread_check("nickcmp")?;
        Ok(self.host.nickcmp(a, b))
    }

    /// Strip mIRC formatting. `length` limits how much of `text` is
    /// considered; `flags` selects colors (1), attributes (2) or both (3,
    /// the default).
    pub fn strip(&self, text: &str, length: Option<i64>, flags: Option<i64>) -> ScriptResult<String> {
        main_thread_check("strip")?;
        let text = match length {
            Some(n) if n >= 0 => {
                let end = text
                    .char_indices()
                    .map(|(i, _)| i)
                    .chain([text.len()])
                    .take_while(|&i| i <= n as usize)
                    .last()
                    .unwrap_or(0);
                &text[..end]
            }
            _ => text,
        };
        Ok(self.host.strip(text, flags.unwrap_or(STRIP_ALL) as i32))
    }

    // -- info and preferences --

    pub fn get_info(&self, id: &str) -> ScriptResult<ScriptValue> {
        main_thread_check("get_info")?;
        match self.host.get_info(id) {
            Some(InfoValue::Str(s)) => Ok(ScriptValue::Str(s)),
            Some(InfoValue::Ptr(p)) => Ok(ScriptValue::Int(p as i64)),
            None => Err(ScriptError::bad_argument(format!("unknown info id {id:?}"))),
        }
    }

    pub fn get_prefs(&self, name: &str) -> ScriptResult<ScriptValue> {
        main_thread_check("get_prefs")?;
        match self.host.get_pref(name) {
            Some(PrefValue::Str(s)) => Ok(ScriptValue::Str(s)),
            Some(PrefValue::Int(n)) => Ok(ScriptValue::Int(n)),
            Some(PrefValue::Bool(b)) => Ok(ScriptValue::Bool(b)),
            None => Err(ScriptError::bad_argument(format!(
                "unknown preference {name:?}"
            ))),
        }
    }

    // -- lists --

    pub fn get_list(&self, name: &str) -> ScriptResult<Vec<ObjectRef>> {
        main_thread_check("get_list")?;
        read_list(Arc::clone(&self.host), &self.registry, self.runtime, name)
    }

    pub fn get_listiter(&self, name: &str) -> ScriptResult<ListIter> {
        ListIter::open(Arc::clone(&self.host), &self.registry, self.runtime, name)
    }

    /// Field names with their one-letter type codes.
    pub fn list_fields(&self, name: &str) -> ScriptResult<Vec<(String, char)>> {
        main_thread_check("list_fields")?;
        Ok(schema_for(self.host.as_ref(), &self.registry, self.runtime, name)?.fields)
    }

    // -- hooks --

    pub fn hook_command(
        &self,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::Command, name, priority, callback, userdata)
    }

    pub fn hook_print(
        &self,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::Print, name, priority, callback, userdata)
    }

    pub fn hook_print_attrs(
        &self,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::PrintAttrs, name, priority, callback, userdata)
    }

    pub fn hook_server(
        &self,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::Server, name, priority, callback, userdata)
    }

    pub fn hook_server_attrs(
        &self,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::ServerAttrs, name, priority, callback, userdata)
    }

    pub fn hook_timer(
        &self,
        interval_ms: u64,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        self.register(HookKind::Timer { interval_ms }, "", PRI_NORM, callback, userdata)
    }

    /// Register a callback to run when this runtime is torn down. No host
    /// token is involved; the registry runs these itself.
    pub fn hook_unload(&self, callback: CallableRef, userdata: ScriptValue) -> ScriptResult<Hook> {
        main_thread_check("hook_unload")?;
        let state = self
            .registry
            .get(self.runtime)
            .ok_or_else(ScriptError::runtime_gone)?;
        let id = self.registry.next_hook_id();
        state.store.lock().add_unload_hook(UnloadHook {
            id,
            callback,
            userdata,
            revoked: false,
        });
        Ok(Hook { id })
    }

    /// Revoke a hook, returning the userdata it was registered with.
    /// Unhooking an already-unhooked handle returns the userdata again
    /// and touches nothing host-side.
    pub fn unhook(&self, hook: Hook) -> ScriptResult<ScriptValue> {
        main_thread_check("unhook")?;
        let state = self
            .registry
            .get(self.runtime)
            .ok_or_else(ScriptError::runtime_gone)?;
        let revoked = {
            let mut store = state.store.lock();
            match store.revoke_hook(hook.id) {
                Some(found) => Some(found),
                None => store.revoke_unload_hook(hook.id).map(|ud| (None, ud)),
            }
        };
        let Some((host_token, userdata)) = revoked else {
            return Err(ScriptError::bad_argument("unknown hook"));
        };
        if let Some(token) = host_token {
            self.host.unhook(token);
        }
        Ok(userdata)
    }

    fn register(
        &self,
        kind: HookKind,
        name: &str,
        priority: i32,
        callback: CallableRef,
        userdata: ScriptValue,
    ) -> ScriptResult<Hook> {
        main_thread_check("hook registration")?;
        let state = self
            .registry
            .get(self.runtime)
            .ok_or_else(ScriptError::runtime_gone)?;
        let id = self.registry.next_hook_id();
        let host_cb = events::make_host_callback(
            kind,
            id,
            Arc::clone(&self.registry),
            self.runtime,
            Arc::clone(&self.host),
        );
        let host_token = self.host.hook(kind, name, priority, host_cb);
        state.store.lock().add_hook(HookEntry {
            id,
            host_token: Some(host_token),
            kind,
            callback,
            userdata,
        });
        Ok(Hook { id })
    }

    // -- contexts --

    pub fn find_context(
        &self,
        network: Option<&str>,
        channel: Option<&str>,
    ) -> ScriptResult<Option<Context>> {
        Context::find(
            network,
            channel,
            Arc::clone(&self.host),
            Arc::clone(&self.registry),
            self.runtime,
        )
    }

    pub fn get_context(&self) -> ScriptResult<Context> {
        main_thread_check("get_context")?;
        Ok(Context::new(
            self.host.get_context(),
            Arc::clone(&self.host),
            Arc::clone(&self.registry),
            self.runtime,
        ))
    }

    pub fn set_context(&self, ctx: &Context) -> ScriptResult<()> {
        ctx.set()
    }

    // -- per-plugin preference storage --
    //
    // Keys are namespaced "<plugin name> <key>" so plugins cannot step on
    // each other; listing strips the prefix again.

    fn pref_key(&self, name: &str) -> String {
        format!("{} {}", self.plugin_name, name)
    }

    pub fn set_pluginpref(&self, name: &str, value: &ScriptValue) -> ScriptResult<()> {
        main_thread_check("set_pluginpref")?;
        let pref = match value {
            ScriptValue::Str(s) => PrefValue::Str(s.clone()),
            ScriptValue::Int(n) => PrefValue::Int(*n),
            ScriptValue::Bool(b) => PrefValue::Bool(*b),
            other => {
                return Err(ScriptError::bad_argument(format!(
                    "preferences hold strings, integers and booleans, not {}",
                    other.type_name()
                )));
            }
        };
        if self.host.set_pluginpref(&self.pref_key(name), pref) {
            Ok(())
        } else {
            Err(ScriptError::new(
                ErrorKind::PreferenceStorage,
                format!("could not store preference {name:?}"),
            ))
        }
    }

    pub fn get_pluginpref(&self, name: &str) -> ScriptResult<ScriptValue> {
        main_thread_check("get_pluginpref")?;
        Ok(match self.host.get_pluginpref(&self.pref_key(name)) {
            Some(PrefValue::Str(s)) => ScriptValue::Str(s),
            Some(PrefValue::Int(n)) => ScriptValue::Int(n),
            Some(PrefValue::Bool(b)) => ScriptValue::Bool(b),
            None => ScriptValue::Null,
        })
    }

    pub fn del_pluginpref(&self, name: &str) -> ScriptResult<()> {
        main_thread_check("del_pluginpref")?;
        if self.host.del_pluginpref(&self.pref_key(name)) {
            Ok(())
        } else {
            Err(ScriptError::new(
                ErrorKind::PreferenceStorage,
                format!("could not delete preference {name:?}"),
            ))
        }
    }

    pub fn list_pluginpref(&self) -> ScriptResult<Vec<String>> {
        main_thread_check("list_pluginpref")?;
        let prefix = format!("{} ", self.plugin_name);
        Ok(self
            .host
            .list_pluginpref()
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    // -- worker-thread surrogates --

    /// The surface as a delegate proxy whose methods block for their
    /// results. Stable across calls.
    pub fn synchronous(self: &Arc<Self>) -> ScriptValue {
        self.sync_surface
            .get_or_init(|| self.make_surface(false))
            .clone()
    }

    /// Like [`PluginApi::synchronous`], but methods answer immediately
    /// with an async-result cell.
    pub fn asynchronous(self: &Arc<Self>) -> ScriptValue {
        self.async_surface
            .get_or_init(|| self.make_surface(true))
            .clone()
    }

    fn make_surface(self: &Arc<Self>, is_async: bool) -> ScriptValue {
        let target = self.surface.get_or_init(|| self.build_surface()).clone();
        ScriptValue::DelegateProxy(DelegateProxy::new(
            Arc::new(target) as Arc<dyn ProxyTarget>,
            is_async,
            Arc::clone(&self.registry),
            self.runtime,
            Arc::clone(&self.host),
        ))
    }

    /// The script-facing method table. Built once per API instance so the
    /// delegates minted for its callables stay identity-stable.
    fn build_surface(self: &Arc<Self>) -> ObjectRef {
        let obj = ObjectRef::new("RelayApi");

        for (name, value) in [
            ("EAT_NONE", i64::from(events::EAT_NONE)),
            ("EAT_HOST", i64::from(events::EAT_HOST)),
            ("EAT_PLUGIN", i64::from(events::EAT_PLUGIN)),
            ("EAT_ALL", i64::from(events::EAT_ALL)),
            ("PRI_HIGHEST", i64::from(PRI_HIGHEST)),
            ("PRI_HIGH", i64::from(PRI_HIGH)),
            ("PRI_NORM", i64::from(PRI_NORM)),
            ("PRI_LOW", i64::from(PRI_LOW)),
            ("PRI_LOWEST", i64::from(PRI_LOWEST)),
            ("STRIP_COLORS", STRIP_COLORS),
            ("STRIP_ATTRS", STRIP_ATTRS),
            ("STRIP_ALL", STRIP_ALL),
        ] {
            obj.set(name, ScriptValue::Int(value));
        }

        let api = Arc::clone(self);
        obj.set(
            "prnt",
            callable(move |args| {
                api.prnt(args.str_arg(0, "prnt")?)?;
                Ok(ScriptValue::Null)
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "command",
            callable(move |args| {
                api.command(args.str_arg(0, "command")?)?;
                Ok(ScriptValue::Null)
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "emit_print",
            callable(move |args| {
                let event = args.str_arg(0, "emit_print")?;
                let rest = collect_string_args(&args, 1, "emit_print")?;
                api.emit_print(event, &rest)?;
                Ok(ScriptValue::Null)
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "emit_print_attrs",
            callable(move |args| {
                let time = args.int_arg(0, "emit_print_attrs")?;
                let event = args.str_arg(1, "emit_print_attrs")?;
                let rest = collect_string_args(&args, 2, "emit_print_attrs")?;
                let attrs = EventAttrs {
                    server_time_utc: time,
                };
                api.emit_print_attrs(&attrs, event, &rest)?;
                Ok(ScriptValue::Null)
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "send_modes",
            callable(move |args| {
                let targets = match args.required(0, "send_modes")? {
                    ScriptValue::List(items) => items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<ScriptResult<Vec<_>>>()?,
                    other => {
                        return Err(ScriptError::bad_argument(format!(
                            "send_modes: targets must be a list, got {}",
                            other.type_name()
                        )));
                    }
                };
                let per_line = args.opt_int(1, "modes_per_line", "send_modes")?.unwrap_or(0);
                let sign = single_char(args.str_arg(2, "send_modes")?, "sign")?;
                let mode = single_char(args.str_arg(3, "send_modes")?, "mode")?;
                api.send_modes(&targets, per_line as i32, sign, mode)?;
                Ok(ScriptValue::Null)
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "nickcmp",
            callable(move |args| {
                let a = args.str_arg(0, "nickcmp")?;
                let b = args.str_arg(1, "nickcmp")?;
                Ok(ScriptValue::Int(i64::from(api.nickcmp(a, b)?)))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "strip",
            callable(move |args| {
                let text = args.str_arg(0, "strip")?;
                let length = args.opt_int(1, "length", "strip")?;
                let flags = args.opt_int(2, "flags", "strip")?;
                Ok(ScriptValue::Str(api.strip(text, length, flags)?))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_info",
            callable(move |args| api.get_info(args.str_arg(0, "get_info")?)),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_prefs",
            callable(move |args| api.get_prefs(args.str_arg(0, "get_prefs")?)),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_list",
            callable(move |args| {
                let rows = api.get_list(args.str_arg(0, "get_list")?)?;
                Ok(ScriptValue::List(
                    rows.into_iter().map(ScriptValue::Object).collect(),
                ))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_listiter",
            callable(move |args| {
                let iter = api.get_listiter(args.str_arg(0, "get_listiter")?)?;
                Ok(ScriptValue::Object(iter.into_object()))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "list_fields",
            callable(move |args| {
                let fields = api.list_fields(args.str_arg(0, "list_fields")?)?;
                Ok(ScriptValue::List(
                    fields
                        .into_iter()
                        .map(|(name, code)| {
                            ScriptValue::List(vec![
                                ScriptValue::Str(name),
                                ScriptValue::Str(code.to_string()),
                            ])
                        })
                        .collect(),
                ))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "find_context",
            callable(move |args| {
                let network = args.opt_str(0, "network", "find_context")?;
                let channel = args.opt_str(1, "channel", "find_context")?;
                Ok(
                    match api.find_context(network.as_deref(), channel.as_deref())? {
                        Some(ctx) => ScriptValue::Context(ctx.handle()),
                        None => ScriptValue::Null,
                    },
                )
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_context",
            callable(move |_| Ok(ScriptValue::Context(api.get_context()?.handle()))),
        );

        let api = Arc::clone(self);
        obj.set(
            "set_context",
            callable(move |args| {
                let handle = args.required(0, "set_context")?.as_context()?;
                let ctx = Context::new(
                    handle,
                    Arc::clone(&api.host),
                    Arc::clone(&api.registry),
                    api.runtime,
                );
                api.set_context(&ctx)?;
                Ok(ScriptValue::Bool(true))
            }),
        );

        for (name, kind) in [
            ("hook_command", HookKind::Command),
            ("hook_print", HookKind::Print),
            ("hook_print_attrs", HookKind::PrintAttrs),
            ("hook_server", HookKind::Server),
            ("hook_server_attrs", HookKind::ServerAttrs),
        ] {
            let api = Arc::clone(self);
            obj.set(
                name,
                callable(move |args| {
                    let event = args.str_arg(0, name)?;
                    let cb = as_callable(args.required(1, name)?, name)?;
                    let userdata = args.get(2).cloned().unwrap_or(ScriptValue::Null);
                    let priority = args
                        .opt_int(3, "priority", name)?
                        .unwrap_or(i64::from(PRI_NORM));
                    let hook = api.register(kind, event, priority as i32, cb, userdata)?;
                    Ok(hook_object(hook))
                }),
            );
        }

        let api = Arc::clone(self);
        obj.set(
            "hook_timer",
            callable(move |args| {
                let interval = args.int_arg(0, "hook_timer")?;
                if interval < 0 {
                    return Err(ScriptError::bad_argument(
                        "hook_timer: interval must not be negative",
                    ));
                }
                let cb = as_callable(args.required(1, "hook_timer")?, "hook_timer")?;
                let userdata = args.get(2).cloned().unwrap_or(ScriptValue::Null);
                let hook = api.hook_timer(interval as u64, cb, userdata)?;
                Ok(hook_object(hook))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "hook_unload",
            callable(move |args| {
                let cb = as_callable(args.required(0, "hook_unload")?, "hook_unload")?;
                let userdata = args.get(1).cloned().unwrap_or(ScriptValue::Null);
                let hook = api.hook_unload(cb, userdata)?;
                Ok(hook_object(hook))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "unhook",
            callable(move |args| {
                let id = match args.required(0, "unhook")? {
                    ScriptValue::Int(n) => *n as u64,
                    ScriptValue::Object(o) => match o.get("id") {
                        Some(ScriptValue::Int(n)) => n as u64,
                        _ => return Err(ScriptError::bad_argument("unhook: not a hook")),
                    },
                    other => {
                        return Err(ScriptError::bad_argument(format!(
                            "unhook: expected a hook, got {}",
                            other.type_name()
                        )));
                    }
                };
                api.unhook(Hook { id })
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "set_pluginpref",
            callable(move |args| {
                let name = args.str_arg(0, "set_pluginpref")?;
                let value = args.required(1, "set_pluginpref")?;
                api.set_pluginpref(name, value)?;
                Ok(ScriptValue::Bool(true))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "get_pluginpref",
            callable(move |args| api.get_pluginpref(args.str_arg(0, "get_pluginpref")?)),
        );

        let api = Arc::clone(self);
        obj.set(
            "del_pluginpref",
            callable(move |args| {
                api.del_pluginpref(args.str_arg(0, "del_pluginpref")?)?;
                Ok(ScriptValue::Bool(true))
            }),
        );

        let api = Arc::clone(self);
        obj.set(
            "list_pluginpref",
            callable(move |_| {
                Ok(ScriptValue::List(
                    api.list_pluginpref()?
                        .into_iter()
                        .map(ScriptValue::Str)
                        .collect(),
                ))
            }),
        );

        obj
    }
}

fn callable<F>(f: F) -> ScriptValue
where
    F: Fn(CallArgs) -> ScriptResult<ScriptValue> + Send + Sync + 'static,
{
    ScriptValue::Callable(CallableRef::new(f))
}

fn hook_object(hook: Hook) -> ScriptValue {
    let obj = ObjectRef::new("Hook");
    obj.set("id", ScriptValue::Int(hook.id as i64));
    ScriptValue::Object(obj)
}

fn single_char(s: &str, what: &str) -> ScriptResult<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(ScriptError::bad_argument(format!(
            "{what} must be a single character"
        ))),
    }
}

/// Accept anything invocable where a callback is expected; proxied
/// callables are rewrapped so the registry stores one uniform shape.
fn as_callable(value: &ScriptValue, op: &str) -> ScriptResult<CallableRef> {
    match value {
        ScriptValue::Callable(c) => Ok(c.clone()),
        v @ (ScriptValue::CallProxy(_)
        | ScriptValue::ObjectProxy(_)
        | ScriptValue::DelegateProxy(_)) => {
            let v = v.clone();
            Ok(CallableRef::new(move |args| v.invoke(args)))
        }
        other => Err(ScriptError::bad_argument(format!(
            "{op}: expected a callable, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::testing::Fixture;

    fn api(fx: &Fixture) -> Arc<PluginApi> {
        let token = fx.registry.create("demo.plugin");
        PluginApi::new(fx.host_dyn(), Arc::clone(&fx.registry), token).unwrap()
    }

    #[test]
    fn command_and_print_reach_the_host() {
        let fx = Fixture::new();
        let api = api(&fx);
        api.command("HELLO world").unwrap();
        api.prnt("printed").unwrap();
        assert_eq!(fx.host.commands(), vec!["HELLO world".to_string()]);
        let home = fx.host.get_context();
        assert_eq!(fx.host.transcript(home), vec!["printed".to_string()]);
    }

    #[test]
    fn main_thread_gate_names_the_remedy() {
        let fx = Fixture::new();
        let api = api(&fx);
        let err = fx.run_worker(move || api.command("X")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::WrongThread);
        assert!(err.message.contains("synchronous/asynchronous"));
    }

    #[test]
    fn get_info_unknown_id_is_bad_argument() {
        let fx = Fixture::new();
        let api = api(&fx);
        assert_eq!(
            api.get_info("network").unwrap(),
            ScriptValue::str("freenode")
        );
        let err = api.get_info("no_such_info").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
    }

    #[test]
    fn pluginprefs_are_namespaced_per_plugin() {
        let fx = Fixture::new();
        let token_a = fx.registry.create("alpha");
        let token_b = fx.registry.create("beta");
        let a = PluginApi::new(fx.host_dyn(), Arc::clone(&fx.registry), token_a).unwrap();
        let b = PluginApi::new(fx.host_dyn(), Arc::clone(&fx.registry), token_b).unwrap();

        a.set_pluginpref("nick", &ScriptValue::str("alice")).unwrap();
        b.set_pluginpref("nick", &ScriptValue::str("bob")).unwrap();

        assert_eq!(a.get_pluginpref("nick").unwrap(), ScriptValue::str("alice"));
        assert_eq!(b.get_pluginpref("nick").unwrap(), ScriptValue::str("bob"));
        assert_eq!(a.list_pluginpref().unwrap(), vec!["nick".to_string()]);

        a.del_pluginpref("nick").unwrap();
        assert_eq!(a.get_pluginpref("nick").unwrap(), ScriptValue::Null);
        assert_eq!(b.get_pluginpref("nick").unwrap(), ScriptValue::str("bob"));
    }

    #[test]
    fn unhook_returns_the_userdata_every_time() {
        let fx = Fixture::new();
        let api = api(&fx);
        let hook = api
            .hook_command(
                "test",
                PRI_NORM,
                CallableRef::new(|_| Ok(ScriptValue::Int(i64::from(events::EAT_ALL)))),
                ScriptValue::str("my userdata"),
            )
            .unwrap();
        assert_eq!(fx.host.hook_count(), 1);
        assert_eq!(api.unhook(hook).unwrap(), ScriptValue::str("my userdata"));
        assert_eq!(fx.host.hook_count(), 0);

        // Unhooking the same handle again keeps answering with the
        // userdata and leaves the host alone.
        assert_eq!(api.unhook(hook).unwrap(), ScriptValue::str("my userdata"));
        assert_eq!(fx.host.hook_count(), 0);

        let err = api.unhook(Hook { id: 9999 }).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
    }

    #[test]
    fn unhooked_unload_hook_is_skipped_at_teardown() {
        let fx = Fixture::new();
        let api = api(&fx);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_cb = Arc::clone(&ran);
        let hook = api
            .hook_unload(
                CallableRef::new(move |_| {
                    ran_cb.fetch_add(1, Ordering::SeqCst);
                    Ok(ScriptValue::Null)
                }),
                ScriptValue::str("bye"),
            )
            .unwrap();
        assert_eq!(api.unhook(hook).unwrap(), ScriptValue::str("bye"));
        assert_eq!(api.unhook(hook).unwrap(), ScriptValue::str("bye"));

        fx.registry.destroy(api.runtime(), fx.host.as_ref()).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn surfaces_are_stable_and_flagged() {
        let fx = Fixture::new();
        let api = api(&fx);
        let sync = api.synchronous();
        let async_ = api.asynchronous();
        assert_eq!(sync, api.synchronous());
        assert_eq!(async_, api.asynchronous());
        assert_ne!(sync, async_);

        let ScriptValue::DelegateProxy(p) = &sync else {
            panic!("expected a delegate proxy");
        };
        assert!(!p.is_async());
        assert_eq!(p.getattr("EAT_ALL").unwrap(), ScriptValue::Int(3));
    }

    #[test]
    fn strip_honors_length_and_flags() {
        let fx = Fixture::new();
        let api = api(&fx);
        let text = format!("{BOLD}bold{RESET} and {COLOR}04red");
        let bare = api.strip(&text, None, None).unwrap();
        assert_eq!(bare, "bold and red");
        let colors_only = api.strip(&text, None, Some(1)).unwrap();
        assert!(colors_only.contains('\x02'));
        assert!(!colors_only.contains('\x03'));
    }

    #[test]
    fn emit_print_unknown_event_is_rejected() {
        let fx = Fixture::new();
        let api = api(&fx);
        api.emit_print("Channel Message", &["nick".into(), "hi".into()])
            .unwrap();
        let err = api
            .emit_print("No Such Event", &[])
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
    }
}
