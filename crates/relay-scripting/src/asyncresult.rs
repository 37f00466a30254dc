//! The async-result cell: a read-once rendezvous between a worker thread
//! and a call dispatched onto the main thread.
//!
//! A cell starts pending, holding the consumer half of a one-slot channel.
//! The first read of `value()` or `error()` blocks until the trampoline
//! delivers, then the cell is resolved forever; later reads return the
//! stored outcome without blocking. The done flag flips *before* the
//! blocking take, so a failed take leaves the cell permanently empty
//! rather than retryable.

use std::sync::Arc;

use parking_lot::Mutex;
use relay_dispatch::slot::Slot;

use crate::error::{ScriptError, ScriptResult};
use crate::host::ContextHandle;
use crate::value::ScriptValue;

/// The tagged outcome a trampoline sends back through the slot.
pub type CallOutcome = Result<ScriptValue, ScriptError>;

/// Hook for turning a bare context handle in a successful outcome into a
/// thread-safe wrapper. Supplied by the delegate; the cell itself knows
/// nothing about proxies.
pub type ContextWrapFn = Arc<dyn Fn(ContextHandle) -> ScriptValue + Send + Sync>;

struct CellState {
    done: bool,
    value: ScriptValue,
    error: Option<ScriptError>,
    slot: Option<Slot<CallOutcome>>,
    wrap: Option<ContextWrapFn>,
}

pub struct AsyncResult {
    state: Mutex<CellState>,
}

impl AsyncResult {
    /// A cell waiting on a trampoline's outcome.
    pub fn pending(slot: Slot<CallOutcome>, wrap: Option<ContextWrapFn>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                done: false,
                value: ScriptValue::Null,
                error: None,
                slot: Some(slot),
                wrap,
            }),
        })
    }

    /// A cell born resolved, for calls that ran inline on the main thread.
    pub fn resolved_ok(value: ScriptValue, wrap: Option<ContextWrapFn>) -> Arc<Self> {
        let value = apply_wrap(value, wrap.as_ref());
        Arc::new(Self {
            state: Mutex::new(CellState {
                done: true,
                value,
                error: None,
                slot: None,
                wrap: None,
            }),
        })
    }

    pub fn resolved_err(error: ScriptError) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                done: true,
                value: ScriptValue::Null,
                error: Some(error),
                slot: None,
                wrap: None,
            }),
        })
    }

    /// Whether the cell has resolved. Never blocks.
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// The call's value. Blocks on first read until the outcome arrives;
    /// `Null` if the call failed (the failure lives in `error()`).
    pub fn value(&self) -> ScriptResult<ScriptValue> {
        let mut state = self.state.lock();
        self.drain(&mut state)?;
        Ok(state.value.clone())
    }

    /// The call's failure, or `None` if it succeeded. Blocks like `value`.
    pub fn error(&self) -> ScriptResult<Option<ScriptError>> {
        let mut state = self.state.lock();
        self.drain(&mut state)?;
        Ok(state.error.clone())
    }

    /// First-read resolution. Marks the cell done before taking from the
    /// slot: if the take fails the cell stays empty for good instead of
    /// handing the next reader a second chance at a dead channel.
    fn drain(&self, state: &mut CellState) -> ScriptResult<()> {
        if state.done {
            return Ok(());
        }
        state.done = true;
        let slot = state.slot.take();
        let wrap = state.wrap.take();
        let outcome = match slot {
            Some(slot) => slot.take().map_err(|_| {
                ScriptError::runtime_gone()
                    .with_frame("waiting for a dispatched call that was discarded")
            })?,
            None => {
                return Err(ScriptError::unsupported(
                    "async result has no pending outcome",
                ));
            }
        };
        match outcome {
            Ok(value) => state.value = apply_wrap(value, wrap.as_ref()),
            Err(err) => state.error = Some(err),
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self.is_done();
        write!(f, "AsyncResult {{ done: {done} }}")
    }
}

/// Successful outcomes that are bare context handles get wrapped; errors
/// never do, and nothing else is touched.
fn apply_wrap(value: ScriptValue, wrap: Option<&ContextWrapFn>) -> ScriptValue {
    match (&value, wrap) {
        (ScriptValue::Context(handle), Some(wrap)) => wrap(*handle),
        _ => value,
    }
}
