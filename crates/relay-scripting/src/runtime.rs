//! Runtime instances and the shared activation lock.
//!
//! Every loaded plugin owns one runtime instance; the embedding itself owns
//! the root instance. Exactly one instance is *active* at a time, guarded by
//! a single re-entrant lock: entering script code means acquiring the lock
//! and swapping the active instance in, leaving means swapping the prior
//! one back. The lock is re-entrant so a host callback that fires while a
//! runtime is already active can activate again without deadlocking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::host::{HookKind, HostApi, HostHookToken};
use crate::value::{CallableRef, ScriptValue};

/// Identity of a runtime instance. Stale tokens resolve to nothing; they
/// never dangle.
pub type RuntimeToken = u64;

/// Verify the calling thread is the host event-loop thread.
///
/// Every host-facing operation calls this first; the message tells the
/// caller the sanctioned way off a worker thread.
pub fn main_thread_check(op: &str) -> ScriptResult<()> {
    if relay_dispatch::is_main_thread() {
        Ok(())
    } else {
        Err(ScriptError::new(
            ErrorKind::WrongThread,
            format!(
                "{op} must be called from the main thread; from a worker, go through \
                 a Delegate or the synchronous/asynchronous surrogate objects"
            ),
        ))
    }
}

/// A cached list schema: field names with the host's one-letter type
/// codes, in host declaration order. Codes stay raw so an undecodable one
/// only fails when that field is actually read.
#[derive(Clone, Debug, PartialEq)]
pub struct ListSchema {
    pub fields: Vec<(String, char)>,
}

impl ListSchema {
    pub fn lookup(&self, field: &str) -> Option<char> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, code)| *code)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }
}

/// A registered event hook. The entry outlives its host registration:
/// revoking clears the host token but keeps the record, so repeated
/// unhooks of the same handle still answer with the userdata.
pub struct HookEntry {
    pub id: u64,
    pub host_token: Option<HostHookToken>,
    pub kind: HookKind,
    pub callback: CallableRef,
    pub userdata: ScriptValue,
}

/// A callback to run when the owning runtime is torn down.
pub struct UnloadHook {
    pub id: u64,
    pub callback: CallableRef,
    pub userdata: ScriptValue,
    pub revoked: bool,
}

/// Per-instance registration store.
#[derive(Default)]
pub struct Store {
    hooks: Vec<HookEntry>,
    unload_hooks: Vec<UnloadHook>,
    schemas: HashMap<String, ListSchema>,
}

impl Store {
    pub fn add_hook(&mut self, entry: HookEntry) {
        self.hooks.push(entry);
    }

    /// Revoke a hook, yielding the host token to release (first call
    /// only) and the userdata (every call). The record stays so a repeat
    /// revoke is answered the same way.
    pub fn revoke_hook(&mut self, id: u64) -> Option<(Option<HostHookToken>, ScriptValue)> {
        let entry = self.hooks.iter_mut().find(|h| h.id == id)?;
        Some((entry.host_token.take(), entry.userdata.clone()))
    }

    pub fn find_hook(&self, id: u64) -> Option<(CallableRef, ScriptValue, HookKind)> {
        self.hooks
            .iter()
            .find(|h| h.id == id && h.host_token.is_some())
            .map(|h| (h.callback.clone(), h.userdata.clone(), h.kind))
    }

    pub fn add_unload_hook(&mut self, hook: UnloadHook) {
        self.unload_hooks.push(hook);
    }

    pub fn revoke_unload_hook(&mut self, id: u64) -> Option<ScriptValue> {
        let hook = self.unload_hooks.iter_mut().find(|h| h.id == id)?;
        hook.revoked = true;
        Some(hook.userdata.clone())
    }

    pub fn schema(&self, list: &str) -> Option<ListSchema> {
        self.schemas.get(list).cloned()
    }

    pub fn cache_schema(&mut self, list: &str, schema: ListSchema) {
        self.schemas.insert(list.to_string(), schema);
    }

    /// Hooks still registered with the host (revoked records excluded).
    pub fn hook_count(&self) -> usize {
        self.hooks.iter().filter(|h| h.host_token.is_some()).count()
    }
}

/// One runtime instance: a plugin's identity plus its registration store.
pub struct RuntimeState {
    pub token: RuntimeToken,
    pub plugin_name: String,
    pub store: Mutex<Store>,
}

/// All live runtime instances plus the activation lock.
///
/// Held behind an `Arc` and passed explicitly to everything that needs it;
/// there is no process-global registry.
pub struct Registry {
    runtimes: Mutex<HashMap<RuntimeToken, Arc<RuntimeState>>>,
    active: ReentrantMutex<RefCell<Option<RuntimeToken>>>,
    next_token: AtomicU64,
    next_hook_id: AtomicU64,
    root: RuntimeToken,
}

impl Registry {
    /// Create a registry with the root instance already present.
    pub fn new() -> Arc<Self> {
        let root_token = 1;
        let mut runtimes = HashMap::new();
        runtimes.insert(
            root_token,
            Arc::new(RuntimeState {
                token: root_token,
                plugin_name: "<host>".to_string(),
                store: Mutex::new(Store::default()),
            }),
        );
        Arc::new(Self {
            runtimes: Mutex::new(runtimes),
            active: ReentrantMutex::new(RefCell::new(None)),
            next_token: AtomicU64::new(root_token + 1),
            next_hook_id: AtomicU64::new(1),
            root: root_token,
        })
    }

    pub fn root(&self) -> RuntimeToken {
        self.root
    }

    pub fn create(&self, plugin_name: &str) -> RuntimeToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.runtimes.lock().insert(
            token,
            Arc::new(RuntimeState {
                token,
                plugin_name: plugin_name.to_string(),
                store: Mutex::new(Store::default()),
            }),
        );
        log::debug!("created runtime {token} for plugin {plugin_name:?}");
        token
    }

    pub fn get(&self, token: RuntimeToken) -> Option<Arc<RuntimeState>> {
        self.runtimes.lock().get(&token).cloned()
    }

    pub fn next_hook_id(&self) -> u64 {
        self.next_hook_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Acquire the activation lock and make `token` the active instance.
    /// The prior active instance is restored when the guard drops, so
    /// activations nest like a stack. Fails with `RuntimeGone` for a token
    /// whose instance has been destroyed.
    pub fn activate(&self, token: RuntimeToken) -> ScriptResult<Activation<'_>> {
        if !self.runtimes.lock().contains_key(&token) {
            return Err(ScriptError::runtime_gone());
        }
        let guard = self.active.lock();
        let prior = *guard.borrow();
        *guard.borrow_mut() = Some(token);
        Ok(Activation { guard, prior })
    }

    /// The currently active instance, if any. Briefly takes the activation
    /// lock, so only meaningful from the thread that holds it (or at
    /// quiescence).
    pub fn active(&self) -> Option<RuntimeToken> {
        *self.active.lock().borrow()
    }

    /// Tear down a runtime: run its unload hooks (most recent registration
    /// last), revoke its host hooks, then drop the instance. Unload hook
    /// errors are reported and do not stop the teardown.
    pub fn destroy(&self, token: RuntimeToken, host: &dyn HostApi) -> ScriptResult<()> {
        main_thread_check("destroy")?;
        let state = self.get(token).ok_or_else(ScriptError::runtime_gone)?;

        let unload_hooks = std::mem::take(&mut state.store.lock().unload_hooks);
        if unload_hooks.iter().any(|h| !h.revoked) {
            let activation = self.activate(token)?;
            for hook in unload_hooks.into_iter().filter(|h| !h.revoked) {
                let args = crate::value::CallArgs::positional(vec![hook.userdata.clone()]);
                if let Err(err) = hook.callback.call(args) {
                    let err = err.with_frame(format!("unload hook of {:?}", state.plugin_name));
                    log::warn!("unload hook failed: {}", err.render());
                    host.print(&err.render());
                }
            }
            drop(activation);
        }

        let hooks = std::mem::take(&mut state.store.lock().hooks);
        let mut revoked = 0usize;
        for hook in &hooks {
            if let Some(token) = hook.host_token {
                host.unhook(token);
                revoked += 1;
            }
        }

        self.runtimes.lock().remove(&token);
        log::debug!(
            "destroyed runtime {token} ({:?}), revoked {revoked} hooks",
            state.plugin_name,
        );
        Ok(())
    }
}

/// RAII witness that a runtime is active. Restores the prior active
/// instance on drop, even if the body unwinds.
pub struct Activation<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<Option<RuntimeToken>>>,
    prior: Option<RuntimeToken>,
}

impl std::fmt::Debug for Activation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activation")
            .field("prior", &self.prior)
            .finish_non_exhaustive()
    }
}

impl Activation<'_> {
    pub fn token(&self) -> Option<RuntimeToken> {
        *self.guard.borrow()
    }
}

impl Drop for Activation<'_> {
    fn drop(&mut self) {
        *self.guard.borrow_mut() = self.prior;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_with_root() {
        let registry = Registry::new();
        let root = registry.root();
        assert!(registry.get(root).is_some());
        assert_eq!(registry.get(root).unwrap().plugin_name, "<host>");
    }

    #[test]
    fn activation_swaps_and_restores() {
        let registry = Registry::new();
        let token = registry.create("demo.lua");
        assert_eq!(registry.active(), None);
        {
            let act = registry.activate(token).unwrap();
            assert_eq!(act.token(), Some(token));
        }
        assert_eq!(registry.active(), None);
    }

    #[test]
    fn activations_nest_like_a_stack() {
        let registry = Registry::new();
        let a = registry.create("a");
        let b = registry.create("b");
        let outer = registry.activate(a).unwrap();
        {
            let inner = registry.activate(b).unwrap();
            assert_eq!(inner.token(), Some(b));
        }
        assert_eq!(outer.token(), Some(a));
    }

    #[test]
    fn reactivating_the_active_instance_does_not_deadlock() {
        let registry = Registry::new();
        let token = registry.create("demo");
        let _outer = registry.activate(token).unwrap();
        let inner = registry.activate(token).unwrap();
        assert_eq!(inner.token(), Some(token));
    }

    #[test]
    fn stale_token_is_runtime_gone() {
        let registry = Registry::new();
        let err = registry.activate(999).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeGone);
    }

    #[test]
    fn activation_lock_is_free_at_quiescence() {
        let registry = Registry::new();
        let token = registry.create("demo");
        drop(registry.activate(token).unwrap());
        // Another thread can take the lock, so nesting balanced out.
        let registry2 = Arc::clone(&registry);
        let taken = std::thread::spawn(move || registry2.activate(token).is_ok())
            .join()
            .unwrap();
        assert!(taken);
    }

    #[test]
    fn store_hooks_add_and_revoke() {
        let mut store = Store::default();
        let cb = CallableRef::new(|_| Ok(ScriptValue::Null));
        store.add_hook(HookEntry {
            id: 7,
            host_token: Some(HostHookToken(1)),
            kind: HookKind::Command,
            callback: cb,
            userdata: ScriptValue::str("ud"),
        });
        assert_eq!(store.hook_count(), 1);
        assert!(store.find_hook(7).is_some());
        assert!(store.revoke_hook(8).is_none());

        // First revoke carries the host token, later ones only userdata;
        // a revoked hook never fires again.
        let (token, userdata) = store.revoke_hook(7).unwrap();
        assert_eq!(token, Some(HostHookToken(1)));
        assert_eq!(userdata, ScriptValue::str("ud"));
        let (token, userdata) = store.revoke_hook(7).unwrap();
        assert_eq!(token, None);
        assert_eq!(userdata, ScriptValue::str("ud"));
        assert_eq!(store.hook_count(), 0);
        assert!(store.find_hook(7).is_none());
    }

    #[test]
    fn schema_cache_round_trip() {
        let mut store = Store::default();
        assert!(store.schema("channels").is_none());
        let schema = ListSchema {
            fields: vec![
                ("channel".to_string(), 's'),
                ("context".to_string(), 'p'),
            ],
        };
        store.cache_schema("channels", schema.clone());
        assert_eq!(store.schema("channels"), Some(schema.clone()));
        assert_eq!(schema.lookup("context"), Some('p'));
        assert_eq!(schema.lookup("nope"), None);
    }
}
