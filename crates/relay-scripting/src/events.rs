//! Demultiplexing host events into plugin callbacks.
//!
//! For each registered hook this module builds the host-side closure: it
//! resolves the owning runtime and hook entry (both may be gone by the
//! time the event fires), activates the runtime, shapes the payload into
//! callback arguments, invokes, and validates what came back. A callback
//! error is reported into the owning runtime's output and the event is
//! left uneaten.

use std::sync::Arc;

use crate::host::{EventAttrs, EventPayload, HookKind, HostApi, HostHookFn};
use crate::runtime::{Registry, RuntimeToken};
use crate::value::{CallArgs, ObjectRef, ScriptValue};

/// Let the event continue to other plugins and the host.
pub const EAT_NONE: i32 = 0;
/// Hide the event from the host, but let other plugins see it.
pub const EAT_HOST: i32 = 1;
/// Hide the event from other plugins, but let the host see it.
pub const EAT_PLUGIN: i32 = 2;
/// Consume the event entirely.
pub const EAT_ALL: i32 = 3;

/// Rest-of-line views: `word_eol[i]` is `word[i..]` joined by spaces.
/// The host supplies these for command and server events; print events
/// only carry `word`, so the demultiplexer fills the gap.
pub fn synth_word_eol(word: &[String]) -> Vec<String> {
    (0..word.len()).map(|i| word[i..].join(" ")).collect()
}

fn words_value(words: &[String]) -> ScriptValue {
    ScriptValue::List(words.iter().map(|w| ScriptValue::str(w.clone())).collect())
}

fn attrs_object(attrs: &EventAttrs) -> ScriptValue {
    let obj = ObjectRef::new("Attributes");
    obj.set("time", ScriptValue::Int(attrs.server_time_utc));
    ScriptValue::Object(obj)
}

/// Build the closure handed to [`HostApi::hook`] for one registration.
pub fn make_host_callback(
    kind: HookKind,
    hook_id: u64,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
    host: Arc<dyn HostApi>,
) -> HostHookFn {
    Box::new(move |payload: &EventPayload| {
        // Both the runtime and the entry can disappear between the host
        // queuing the event and us handling it.
        let Some(state) = registry.get(runtime) else {
            return EAT_NONE;
        };
        let Some((callback, userdata, _)) = state.store.lock().find_hook(hook_id) else {
            return EAT_NONE;
        };

        let args = shape_args(kind, payload, userdata);
        let outcome = match registry.activate(runtime) {
            Ok(_active) => callback.call(args),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(ret) => {
                if matches!(kind, HookKind::Timer { .. }) {
                    let keep = ret.is_truthy();
                    if !keep {
                        // The host drops its side; drop ours too.
                        if let Some((Some(token), _)) = state.store.lock().revoke_hook(hook_id) {
                            host.unhook(token);
                        }
                    }
                    i32::from(keep)
                } else {
                    validate_eat(&ret, &host)
                }
            }
            Err(err) => {
                let err = err.with_frame(format!("{} hook of {:?}", kind_label(kind), state.plugin_name));
                log::warn!("hook callback failed: {}", err.render());
                host.print(&err.render());
                if matches!(kind, HookKind::Timer { .. }) {
                    if let Some((Some(token), _)) = state.store.lock().revoke_hook(hook_id) {
                        host.unhook(token);
                    }
                    0
                } else {
                    EAT_NONE
                }
            }
        }
    })
}

fn shape_args(kind: HookKind, payload: &EventPayload, userdata: ScriptValue) -> CallArgs {
    match kind {
        HookKind::Timer { .. } => CallArgs::positional(vec![userdata]),
        HookKind::Command | HookKind::Print | HookKind::Server => {
            let word_eol = match &payload.word_eol {
                Some(eol) => words_value(eol),
                None => words_value(&synth_word_eol(&payload.word)),
            };
            CallArgs::positional(vec![words_value(&payload.word), word_eol, userdata])
        }
        HookKind::PrintAttrs | HookKind::ServerAttrs => {
            let word_eol = match &payload.word_eol {
                Some(eol) => words_value(eol),
                None => words_value(&synth_word_eol(&payload.word)),
            };
            let attrs = payload.attrs.unwrap_or_default();
            CallArgs::positional(vec![
                words_value(&payload.word),
                word_eol,
                userdata,
                attrs_object(&attrs),
            ])
        }
    }
}

/// Callbacks must answer with an eat code; anything else is reported and
/// treated as "didn't eat". `Null` is the usual "fell off the end" return
/// and passes silently.
fn validate_eat(ret: &ScriptValue, host: &Arc<dyn HostApi>) -> i32 {
    match ret {
        ScriptValue::Null => EAT_NONE,
        ScriptValue::Bool(b) => i32::from(*b),
        ScriptValue::Int(n) if (EAT_NONE as i64..=EAT_ALL as i64).contains(n) => *n as i32,
        other => {
            let msg = format!(
                "hook callback returned {}; expected EAT_NONE, EAT_HOST, EAT_PLUGIN or EAT_ALL",
                other.repr()
            );
            log::warn!("{msg}");
            host.print(&msg);
            EAT_NONE
        }
    }
}

fn kind_label(kind: HookKind) -> &'static str {
    match kind {
        HookKind::Command => "command",
        HookKind::Print => "print",
        HookKind::PrintAttrs => "print-attrs",
        HookKind::Server => "server",
        HookKind::ServerAttrs => "server-attrs",
        HookKind::Timer { .. } => "timer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_eol_is_suffix_joins() {
        let word: Vec<String> = ["JOIN", "#rust", "now"].map(String::from).into();
        assert_eq!(
            synth_word_eol(&word),
            vec!["JOIN #rust now".to_string(), "#rust now".to_string(), "now".to_string()]
        );
        assert!(synth_word_eol(&[]).is_empty());
    }
}
