//! Rerouting calls onto the host event-loop thread.
//!
//! A [`Delegate`] wraps a callable that must run on the main thread. Called
//! from the main thread it runs inline, with the owning runtime activated.
//! Called from a worker it packages the call into a trampoline, enqueues it
//! through the host's zero-delay timer primitive, and either blocks on a
//! one-slot channel for the outcome (synchronous flavor) or hands back an
//! [`AsyncResult`] cell immediately (asynchronous flavor).

use std::sync::Arc;

use relay_dispatch::{SpawnFunc, is_main_thread, slot};

use crate::asyncresult::{AsyncResult, CallOutcome, ContextWrapFn};
use crate::context;
use crate::error::{ScriptError, ScriptResult};
use crate::host::HostApi;
use crate::runtime::{Registry, RuntimeToken};
use crate::value::{CallArgs, CallableRef, ScriptValue};

pub struct Delegate {
    callable: CallableRef,
    is_async: bool,
    name: Option<String>,
    registry: Arc<Registry>,
    runtime: RuntimeToken,
    host: Arc<dyn HostApi>,
}

impl Delegate {
    pub fn new(
        callable: CallableRef,
        is_async: bool,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
        host: Arc<dyn HostApi>,
    ) -> Self {
        Self {
            callable,
            is_async,
            name: None,
            registry,
            runtime,
            host,
        }
    }

    pub fn with_name(
        callable: CallableRef,
        is_async: bool,
        name: impl Into<String>,
        registry: Arc<Registry>,
        runtime: RuntimeToken,
        host: Arc<dyn HostApi>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(callable, is_async, registry, runtime, host)
        }
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    /// Run the wrapped callable on the main thread, from wherever we are.
    pub fn call(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        if is_main_thread() {
            self.call_inline(args)
        } else {
            self.call_via_trampoline(args)
        }
    }

    /// Already on the main thread: activate and run directly. The
    /// asynchronous flavor still answers with a cell, just one born
    /// resolved, so callers see one shape per flavor.
    fn call_inline(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        let outcome = self.run_activated(args);
        if self.is_async {
            let cell = match outcome {
                Ok(value) => AsyncResult::resolved_ok(value, Some(self.context_wrap())),
                Err(err) => AsyncResult::resolved_err(err),
            };
            Ok(ScriptValue::AsyncResult(cell))
        } else {
            Ok(self.wrap_context(outcome?))
        }
    }

    fn call_via_trampoline(&self, args: CallArgs) -> ScriptResult<ScriptValue> {
        let (tx, rx) = slot::pair::<CallOutcome>();
        let callable = self.callable.clone();
        let registry = Arc::clone(&self.registry);
        let runtime = self.runtime;
        let frame = self.frame_label();

        let trampoline: SpawnFunc = Box::new(move || {
            let outcome = match registry.activate(runtime) {
                Ok(_active) => callable.call(args).map_err(|err| err.with_frame(frame.clone())),
                Err(gone) => Err(gone),
            };
            // The consumer may already have given up; nothing to do then.
            let _ = tx.send(outcome);
        });
        self.host.timer_enqueue(trampoline);

        if self.is_async {
            Ok(ScriptValue::AsyncResult(AsyncResult::pending(
                rx,
                Some(self.context_wrap()),
            )))
        } else {
            let outcome = rx.take().map_err(|_| {
                ScriptError::runtime_gone()
                    .with_frame("waiting for a dispatched call that was discarded")
            })?;
            Ok(self.wrap_context(outcome?))
        }
    }

    fn run_activated(&self, args: CallArgs) -> CallOutcome {
        let _active = self.registry.activate(self.runtime)?;
        self.callable
            .call(args)
            .map_err(|err| err.with_frame(self.frame_label()))
    }

    /// A bare context handle in a successful result gets rebound as a
    /// delegate proxy of the same flavor, so the caller's thread can keep
    /// using it.
    fn wrap_context(&self, value: ScriptValue) -> ScriptValue {
        match value {
            ScriptValue::Context(handle) => context::wrap_context(
                handle,
                self.is_async,
                Arc::clone(&self.registry),
                self.runtime,
                Arc::clone(&self.host),
            ),
            other => other,
        }
    }

    fn context_wrap(&self) -> ContextWrapFn {
        let is_async = self.is_async;
        let registry = Arc::clone(&self.registry);
        let runtime = self.runtime;
        let host = Arc::clone(&self.host);
        Arc::new(move |handle| {
            context::wrap_context(
                handle,
                is_async,
                Arc::clone(&registry),
                runtime,
                Arc::clone(&host),
            )
        })
    }

    fn frame_label(&self) -> String {
        match &self.name {
            Some(name) => format!("delegated call {name:?}"),
            None => "delegated call".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn probe_active(registry: &Arc<Registry>) -> CallableRef {
        let registry = Arc::clone(registry);
        CallableRef::new(move |_| {
            Ok(ScriptValue::Int(registry.active().map_or(-1, |t| t as i64)))
        })
    }

    #[test]
    fn sync_delegate_runs_inline_on_main() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let delegate = Delegate::new(
            probe_active(&fx.registry),
            false,
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        );
        let result = delegate.call(CallArgs::none()).unwrap();
        assert_eq!(result, ScriptValue::Int(token as i64));
        assert_eq!(fx.registry.active(), None);
    }

    #[test]
    fn sync_delegate_from_worker_blocks_for_the_outcome() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let delegate = Arc::new(Delegate::new(
            probe_active(&fx.registry),
            false,
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        ));

        let result = fx.run_worker(move || delegate.call(CallArgs::none()));
        assert_eq!(result.unwrap(), ScriptValue::Int(token as i64));
    }

    #[test]
    fn async_delegate_from_worker_returns_a_cell() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let delegate = Arc::new(Delegate::new(
            CallableRef::new(|_| Ok(ScriptValue::str("done"))),
            true,
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        ));

        let value = fx.run_worker(move || {
            let cell = delegate.call(CallArgs::none()).unwrap();
            let ScriptValue::AsyncResult(cell) = cell else {
                panic!("expected an async result");
            };
            cell.value()
        });
        assert_eq!(value.unwrap(), ScriptValue::str("done"));
    }

    #[test]
    fn async_inline_call_is_born_resolved() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let delegate = Delegate::new(
            CallableRef::new(|_| Ok(ScriptValue::Int(1))),
            true,
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        );
        let ScriptValue::AsyncResult(cell) = delegate.call(CallArgs::none()).unwrap() else {
            panic!("expected an async result");
        };
        assert!(cell.is_done());
        assert_eq!(cell.value().unwrap(), ScriptValue::Int(1));
    }

    #[test]
    fn callback_error_crosses_back_with_a_frame() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let delegate = Arc::new(Delegate::with_name(
            CallableRef::new(|_| Err(ScriptError::bad_argument("bad input"))),
            false,
            "emit",
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        ));

        let err = fx
            .run_worker(move || delegate.call(CallArgs::none()))
            .unwrap_err();
        assert_eq!(err.message, "bad input");
        assert!(err.frames.iter().any(|f| f.contains("emit")));
    }

    #[test]
    fn delegate_into_destroyed_runtime_reports_runtime_gone() {
        let fx = Fixture::new();
        let delegate = Arc::new(Delegate::new(
            CallableRef::new(|_| Ok(ScriptValue::Null)),
            false,
            Arc::clone(&fx.registry),
            999,
            fx.host.clone(),
        ));
        let err = fx
            .run_worker(move || delegate.call(CallArgs::none()))
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::RuntimeGone);
    }

    #[test]
    fn sync_context_result_is_rebound_for_the_worker() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let handle = fx.host.get_context();
        let delegate = Arc::new(Delegate::new(
            CallableRef::new(move |_| Ok(ScriptValue::Context(handle))),
            false,
            Arc::clone(&fx.registry),
            token,
            fx.host.clone(),
        ));

        let result = fx.run_worker(move || delegate.call(CallArgs::none())).unwrap();
        assert!(matches!(result, ScriptValue::DelegateProxy(_)));
    }
}
