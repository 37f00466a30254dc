//! Embedding scripting runtimes in a single-threaded chat host.
//!
//! The host runs one event-loop thread and its entire API is only legal
//! there. Scripts, however, spawn worker threads freely. This crate closes
//! that gap with a cross-thread call dispatcher:
//!
//! - [`delegate::Delegate`] reroutes a call onto the main thread through
//!   the host's zero-delay timer queue, blocking for the outcome or
//!   handing back an [`asyncresult::AsyncResult`] cell.
//! - [`api::PluginApi`] is the per-plugin facade; its `synchronous` and
//!   `asynchronous` surrogates project the whole surface as worker-safe
//!   delegate proxies.
//! - [`runtime::Registry`] tracks runtime instances behind one re-entrant
//!   activation lock, so callbacks and proxied calls always run with the
//!   right instance swapped in.
//! - [`proxy`] wraps values that cross runtime boundaries; [`context`]
//!   binds the host's buffers with switch-and-restore discipline.
//!
//! The dispatch plumbing itself (scheduler binding, one-slot outcome
//! channels) lives in the `relay-dispatch` crate.

pub mod api;
pub mod asyncresult;
pub mod context;
pub mod delegate;
pub mod error;
pub mod events;
pub mod host;
pub mod listiter;
pub mod proxy;
pub mod runtime;
pub mod testing;
pub mod value;

pub use api::{Hook, PluginApi};
pub use asyncresult::AsyncResult;
pub use context::Context;
pub use delegate::Delegate;
pub use error::{ErrorKind, ScriptError, ScriptResult};
pub use events::{EAT_ALL, EAT_HOST, EAT_NONE, EAT_PLUGIN};
pub use host::{ContextHandle, EventAttrs, EventPayload, HookKind, HostApi};
pub use runtime::{Registry, RuntimeToken, main_thread_check};
pub use value::{CallArgs, CallableRef, ObjectRef, ScriptValue};
