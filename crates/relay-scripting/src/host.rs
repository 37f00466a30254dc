//! The chat host as this layer sees it.
//!
//! Everything the scripting layer does ultimately lands on one of these
//! methods, and apart from [`HostApi::timer_enqueue`] every one of them is
//! only legal on the host's event-loop thread. The trait keeps the layer
//! testable: tests drive a loopback implementation, an embedding binds the
//! real client.

use relay_dispatch::SpawnFunc;

/// Opaque identity of a host context (a server/channel/query buffer).
/// Two handles are the same context iff the values are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Token for a registered host-side hook, used to revoke it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostHookToken(pub u64);

/// Handle for an open list cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListCursorId(pub u64);

/// Which event stream a hook attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Command,
    Print,
    PrintAttrs,
    Server,
    ServerAttrs,
    /// Repeating timer with the given period.
    Timer { interval_ms: u64 },
}

/// Extra metadata attached to `*_attrs` event flavors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventAttrs {
    /// Server-supplied timestamp, seconds since the Unix epoch. Zero when
    /// the server sent none.
    pub server_time_utc: i64,
}

/// What the demultiplexer receives when a hooked event fires.
///
/// `word` is the event's positional fields. `word_eol` is the
/// rest-of-line view; the host supplies it for command and server events
/// and the demultiplexer synthesizes it for print events.
#[derive(Clone, Debug, Default)]
pub struct EventPayload {
    pub word: Vec<String>,
    pub word_eol: Option<Vec<String>>,
    pub attrs: Option<EventAttrs>,
}

/// Host-side hook callback: receives the payload, returns an eat code
/// (or, for timers, nonzero to keep the timer alive).
pub type HostHookFn = Box<dyn Fn(&EventPayload) -> i32 + Send + Sync>;

/// A value from the host's info table.
#[derive(Clone, Debug, PartialEq)]
pub enum InfoValue {
    Str(String),
    /// Raw pointer-valued ids (window handles and the like).
    Ptr(u64),
}

/// A value from the host's preference table or a plugin's own store.
#[derive(Clone, Debug, PartialEq)]
pub enum PrefValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Decoded type of a list field, from the host's one-letter codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Int,
    Ptr,
    Time,
}

impl FieldType {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            's' => Some(FieldType::Str),
            'i' => Some(FieldType::Int),
            'p' => Some(FieldType::Ptr),
            't' => Some(FieldType::Time),
            _ => None,
        }
    }
}

/// The host surface. One implementation per embedding.
pub trait HostApi: Send + Sync {
    // -- the single any-thread primitive --

    /// Enqueue a zero-delay one-shot callback onto the host's timer queue.
    /// The only method callable from any thread.
    fn timer_enqueue(&self, f: SpawnFunc);

    // -- output and commands, against the currently selected context --

    fn print(&self, text: &str);
    fn command(&self, text: &str);
    /// Returns false when the host knows no text event by that name.
    fn emit_print(&self, event: &str, args: &[String], attrs: Option<&EventAttrs>) -> bool;
    fn send_modes(&self, targets: &[String], modes_per_line: i32, sign: char, mode: char);
    fn nickcmp(&self, a: &str, b: &str) -> i32;
    fn strip(&self, text: &str, flags: i32) -> String;

    // -- info and preferences --

    fn get_info(&self, id: &str) -> Option<InfoValue>;
    fn get_pref(&self, name: &str) -> Option<PrefValue>;

    // -- context selection --

    fn find_context(&self, network: Option<&str>, channel: Option<&str>) -> Option<ContextHandle>;
    fn get_context(&self) -> ContextHandle;
    /// Returns false when the handle no longer names a live context.
    fn set_context(&self, handle: ContextHandle) -> bool;

    // -- hooks --

    fn hook(&self, kind: HookKind, name: &str, priority: i32, cb: HostHookFn) -> HostHookToken;
    fn unhook(&self, token: HostHookToken);

    // -- lists --

    /// Field names and one-letter type codes, or None for an unknown list.
    fn list_fields(&self, name: &str) -> Option<Vec<(String, char)>>;
    fn list_open(&self, name: &str) -> Option<ListCursorId>;
    fn list_next(&self, cursor: ListCursorId) -> bool;
    fn list_close(&self, cursor: ListCursorId);
    /// String fields arrive as raw bytes; decoding is the caller's problem.
    fn list_str(&self, cursor: ListCursorId, field: &str) -> Option<Vec<u8>>;
    fn list_int(&self, cursor: ListCursorId, field: &str) -> Option<i64>;
    fn list_time(&self, cursor: ListCursorId, field: &str) -> Option<i64>;
    fn list_ptr(&self, cursor: ListCursorId, field: &str) -> Option<u64>;

    // -- per-plugin preference storage --

    fn set_pluginpref(&self, key: &str, value: PrefValue) -> bool;
    fn get_pluginpref(&self, key: &str) -> Option<PrefValue>;
    fn del_pluginpref(&self, key: &str) -> bool;
    fn list_pluginpref(&self) -> Vec<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_codes() {
        assert_eq!(FieldType::from_code('s'), Some(FieldType::Str));
        assert_eq!(FieldType::from_code('i'), Some(FieldType::Int));
        assert_eq!(FieldType::from_code('p'), Some(FieldType::Ptr));
        assert_eq!(FieldType::from_code('t'), Some(FieldType::Time));
        assert_eq!(FieldType::from_code('x'), None);
    }

    #[test]
    fn context_handles_compare_by_value() {
        assert_eq!(ContextHandle(3), ContextHandle(3));
        assert_ne!(ContextHandle(3), ContextHandle(4));
    }
}
