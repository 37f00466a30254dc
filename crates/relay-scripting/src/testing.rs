//! In-process loopback host for tests and examples.
//!
//! [`LoopbackHost`] implements the whole [`HostApi`] against in-memory
//! state: contexts with transcripts, hook tables, preference maps, and
//! list cursors over snapshot rows. [`Fixture`] bundles it with a
//! [`SimpleExecutor`] main loop and a fresh registry, serializing tests
//! behind one lock because the scheduler and main-thread mark are
//! process-global.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use relay_dispatch::{SimpleExecutor, SpawnFunc, enqueue_on_main};

use crate::api::PluginApi;
use crate::events::{EAT_ALL, EAT_NONE, EAT_PLUGIN};
use crate::host::{
    ContextHandle, EventAttrs, EventPayload, HookKind, HostApi, HostHookFn, HostHookToken,
    InfoValue, ListCursorId, PrefValue,
};
use crate::runtime::Registry;

type SharedHookFn = Arc<dyn Fn(&EventPayload) -> i32 + Send + Sync>;

struct ContextRecord {
    handle: ContextHandle,
    network: String,
    channel: String,
    transcript: Vec<String>,
}

struct HostHook {
    token: HostHookToken,
    kind: HookKind,
    name: String,
    priority: i32,
    cb: SharedHookFn,
}

#[derive(Clone)]
enum Cell {
    Str(Vec<u8>),
    Int(i64),
    Time(i64),
    Ptr(u64),
}

struct Cursor {
    rows: Vec<HashMap<String, Cell>>,
    pos: Option<usize>,
}

#[derive(Clone)]
pub struct UserRow {
    pub nick: String,
    pub host: String,
    pub prefix: String,
    pub away: bool,
    pub lasttalk: i64,
}

struct HostState {
    contexts: Vec<ContextRecord>,
    current: ContextHandle,
    next_id: u64,
    hooks: Vec<HostHook>,
    cursors: HashMap<u64, Cursor>,
    users: Vec<UserRow>,
    prefs: HashMap<String, PrefValue>,
    pluginprefs: HashMap<String, PrefValue>,
    commands: Vec<String>,
    emitted: Vec<(String, Vec<String>, Option<EventAttrs>)>,
    nick: String,
}

pub struct LoopbackHost {
    state: Mutex<HostState>,
}

const KNOWN_EVENTS: &[&str] = &[
    "Channel Message",
    "Channel Msg Hilight",
    "Private Message",
    "Notice",
    "Generic Message",
    "Motd",
];

impl LoopbackHost {
    pub fn new() -> Arc<Self> {
        let home = ContextHandle(1);
        Arc::new(Self {
            state: Mutex::new(HostState {
                contexts: vec![ContextRecord {
                    handle: home,
                    network: "freenode".to_string(),
                    channel: "#relay".to_string(),
                    transcript: Vec::new(),
                }],
                current: home,
                next_id: 2,
                hooks: Vec::new(),
                cursors: HashMap::new(),
                users: vec![
                    UserRow {
                        nick: "alice".to_string(),
                        host: "alice@host.one".to_string(),
                        prefix: "@".to_string(),
                        away: false,
                        lasttalk: 1_700_000_000,
                    },
                    UserRow {
                        nick: "bob".to_string(),
                        host: "bob@host.two".to_string(),
                        prefix: "".to_string(),
                        away: true,
                        lasttalk: 1_700_000_100,
                    },
                ],
                prefs: HashMap::from([
                    ("irc_nick1".to_string(), PrefValue::Str("relaybot".to_string())),
                    ("flood_msg_num".to_string(), PrefValue::Int(5)),
                    ("input_flash_priv".to_string(), PrefValue::Bool(true)),
                ]),
                pluginprefs: HashMap::new(),
                commands: Vec::new(),
                emitted: Vec::new(),
                nick: "relaybot".to_string(),
            }),
        })
    }

    // -- test-side controls --

    pub fn add_context(&self, network: &str, channel: &str) -> ContextHandle {
        let mut state = self.state.lock();
        let handle = ContextHandle(state.next_id);
        state.next_id += 1;
        state.contexts.push(ContextRecord {
            handle,
            network: network.to_string(),
            channel: channel.to_string(),
            transcript: Vec::new(),
        });
        handle
    }

    /// Simulate the host closing a buffer; its handle goes stale.
    pub fn remove_context(&self, handle: ContextHandle) {
        let mut state = self.state.lock();
        state.contexts.retain(|c| c.handle != handle);
        if state.current == handle {
            if let Some(first) = state.contexts.first() {
                state.current = first.handle;
            }
        }
    }

    pub fn transcript(&self, handle: ContextHandle) -> Vec<String> {
        self.state
            .lock()
            .contexts
            .iter()
            .find(|c| c.handle == handle)
            .map(|c| c.transcript.clone())
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn emitted(&self) -> Vec<(String, Vec<String>, Option<EventAttrs>)> {
        self.state.lock().emitted.clone()
    }

    pub fn set_pref(&self, name: &str, value: PrefValue) {
        self.state.lock().prefs.insert(name.to_string(), value);
    }

    pub fn set_users(&self, users: Vec<UserRow>) {
        self.state.lock().users = users;
    }

    pub fn hook_count(&self) -> usize {
        self.state.lock().hooks.len()
    }

    // -- event injection --

    /// Deliver a typed command line ("/cmd args"). Returns the final eat
    /// code after offering the event to matching hooks, highest priority
    /// first.
    pub fn fire_command(&self, line: &str) -> i32 {
        let word: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if word.is_empty() {
            return EAT_NONE;
        }
        let payload = EventPayload {
            word_eol: Some(crate::events::synth_word_eol(&word)),
            word,
            attrs: None,
        };
        let name = payload.word[0].clone();
        self.dispatch(
            |hook| {
                matches!(hook.kind, HookKind::Command)
                    && hook.name.eq_ignore_ascii_case(&name)
            },
            &payload,
        )
    }

    pub fn fire_print(&self, event: &str, word: Vec<String>) -> i32 {
        let payload = EventPayload {
            word,
            word_eol: None,
            attrs: None,
        };
        self.dispatch(
            |hook| matches!(hook.kind, HookKind::Print) && hook.name == event,
            &payload,
        )
    }

    pub fn fire_print_attrs(&self, event: &str, word: Vec<String>, attrs: EventAttrs) -> i32 {
        let payload = EventPayload {
            word,
            word_eol: None,
            attrs: Some(attrs),
        };
        self.dispatch(
            |hook| matches!(hook.kind, HookKind::PrintAttrs) && hook.name == event,
            &payload,
        )
    }

    pub fn fire_server(&self, command: &str, word: Vec<String>) -> i32 {
        let payload = EventPayload {
            word_eol: Some(crate::events::synth_word_eol(&word)),
            word,
            attrs: None,
        };
        self.dispatch(
            |hook| matches!(hook.kind, HookKind::Server) && hook.name.eq_ignore_ascii_case(command),
            &payload,
        )
    }

    pub fn fire_server_attrs(&self, command: &str, word: Vec<String>, attrs: EventAttrs) -> i32 {
        let payload = EventPayload {
            word_eol: Some(crate::events::synth_word_eol(&word)),
            word,
            attrs: Some(attrs),
        };
        self.dispatch(
            |hook| {
                matches!(hook.kind, HookKind::ServerAttrs)
                    && hook.name.eq_ignore_ascii_case(command)
            },
            &payload,
        )
    }

    /// Fire every registered timer once, dropping the ones whose callback
    /// asked to stop. Returns how many fired.
    pub fn tick_timers(&self) -> usize {
        let timers: Vec<(HostHookToken, SharedHookFn)> = {
            let state = self.state.lock();
            state
                .hooks
                .iter()
                .filter(|h| matches!(h.kind, HookKind::Timer { .. }))
                .map(|h| (h.token, Arc::clone(&h.cb)))
                .collect()
        };
        let payload = EventPayload::default();
        let mut fired = 0;
        for (token, cb) in timers {
            fired += 1;
            if cb(&payload) == 0 {
                self.unhook(token);
            }
        }
        fired
    }

    fn dispatch(&self, matches: impl Fn(&HostHook) -> bool, payload: &EventPayload) -> i32 {
        // Snapshot outside the lock: callbacks re-enter the host freely.
        let mut hooks: Vec<(i32, SharedHookFn)> = {
            let state = self.state.lock();
            state
                .hooks
                .iter()
                .filter(|h| matches(h))
                .map(|h| (h.priority, Arc::clone(&h.cb)))
                .collect()
        };
        hooks.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));

        let mut eaten = EAT_NONE;
        for (_, cb) in hooks {
            let ret = cb(payload);
            eaten = eaten.max(ret);
            if ret >= EAT_PLUGIN {
                break;
            }
        }
        eaten.min(EAT_ALL)
    }

    fn snapshot_rows(&self, list: &str) -> Option<Vec<HashMap<String, Cell>>> {
        let state = self.state.lock();
        match list {
            "channels" => Some(
                state
                    .contexts
                    .iter()
                    .map(|c| {
                        HashMap::from([
                            ("channel".to_string(), Cell::Str(c.channel.clone().into_bytes())),
                            ("network".to_string(), Cell::Str(c.network.clone().into_bytes())),
                            ("context".to_string(), Cell::Ptr(c.handle.0)),
                            ("type".to_string(), Cell::Int(2)),
                            ("users".to_string(), Cell::Int(state.users.len() as i64)),
                        ])
                    })
                    .collect(),
            ),
            "users" => Some(
                state
                    .users
                    .iter()
                    .map(|u| {
                        HashMap::from([
                            ("nick".to_string(), Cell::Str(u.nick.clone().into_bytes())),
                            ("host".to_string(), Cell::Str(u.host.clone().into_bytes())),
                            ("prefix".to_string(), Cell::Str(u.prefix.clone().into_bytes())),
                            ("away".to_string(), Cell::Int(i64::from(u.away))),
                            ("lasttalk".to_string(), Cell::Time(u.lasttalk)),
                            ("selected".to_string(), Cell::Int(0)),
                        ])
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    fn read_cell(&self, cursor: ListCursorId, field: &str) -> Option<Cell> {
        let state = self.state.lock();
        let cursor = state.cursors.get(&cursor.0)?;
        let row = cursor.rows.get(cursor.pos?)?;
        row.get(field).cloned()
    }
}

impl HostApi for LoopbackHost {
    fn timer_enqueue(&self, f: SpawnFunc) {
        enqueue_on_main(f);
    }

    fn print(&self, text: &str) {
        let mut state = self.state.lock();
        let current = state.current;
        if let Some(ctx) = state.contexts.iter_mut().find(|c| c.handle == current) {
            ctx.transcript.push(text.to_string());
        }
    }

    fn command(&self, text: &str) {
        self.state.lock().commands.push(text.to_string());
    }

    fn emit_print(&self, event: &str, args: &[String], attrs: Option<&EventAttrs>) -> bool {
        if !KNOWN_EVENTS.contains(&event) {
            return false;
        }
        let mut state = self.state.lock();
        state
            .emitted
            .push((event.to_string(), args.to_vec(), attrs.copied()));
        let line = format!("* {event}: {}", args.join(" "));
        let current = state.current;
        if let Some(ctx) = state.contexts.iter_mut().find(|c| c.handle == current) {
            ctx.transcript.push(line);
        }
        true
    }

    fn send_modes(&self, targets: &[String], modes_per_line: i32, sign: char, mode: char) {
        let chunk = if modes_per_line > 0 {
            modes_per_line as usize
        } else {
            targets.len().max(1)
        };
        let mut state = self.state.lock();
        for group in targets.chunks(chunk) {
            let modes: String = std::iter::repeat(mode).take(group.len()).collect();
            state
                .commands
                .push(format!("MODE {sign}{modes} {}", group.join(" ")));
        }
    }

    fn nickcmp(&self, a: &str, b: &str) -> i32 {
        fn fold(c: char) -> char {
            match c {
                '{' => '[',
                '}' => ']',
                '|' => '\\',
                '^' => '~',
                c => c.to_ascii_lowercase(),
            }
        }
        let a = a.chars().map(fold);
        let b = b.chars().map(fold);
        match a.cmp(b) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }
    }

    fn strip(&self, text: &str, flags: i32) -> String {
        let strip_colors = flags & 1 != 0;
        let strip_attrs = flags & 2 != 0;
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\x03' && strip_colors {
                i += 1;
                let mut digits = 0;
                while i < chars.len() && chars[i].is_ascii_digit() && digits < 2 {
                    i += 1;
                    digits += 1;
                }
                if digits > 0 && i < chars.len() && chars[i] == ',' {
                    let mut j = i + 1;
                    let mut bg = 0;
                    while j < chars.len() && chars[j].is_ascii_digit() && bg < 2 {
                        j += 1;
                        bg += 1;
                    }
                    if bg > 0 {
                        i = j;
                    }
                }
                continue;
            }
            if matches!(c, '\x02' | '\x1f' | '\x1d' | '\x0f' | '\x07' | '\x16') && strip_attrs {
                i += 1;
                continue;
            }
            out.push(c);
            i += 1;
        }
        out
    }

    fn get_info(&self, id: &str) -> Option<InfoValue> {
        let state = self.state.lock();
        let current = state.contexts.iter().find(|c| c.handle == state.current)?;
        match id {
            "network" => Some(InfoValue::Str(current.network.clone())),
            "channel" => Some(InfoValue::Str(current.channel.clone())),
            "nick" => Some(InfoValue::Str(state.nick.clone())),
            "host" => Some(InfoValue::Str("irc.example.net".to_string())),
            "topic" => Some(InfoValue::Str(String::new())),
            "version" => Some(InfoValue::Str("2.16.2".to_string())),
            "win_ptr" => Some(InfoValue::Ptr(0x5150)),
            _ => None,
        }
    }

    fn get_pref(&self, name: &str) -> Option<PrefValue> {
        self.state.lock().prefs.get(name).cloned()
    }

    fn find_context(&self, network: Option<&str>, channel: Option<&str>) -> Option<ContextHandle> {
        let state = self.state.lock();
        state
            .contexts
            .iter()
            .find(|c| {
                network.is_none_or(|n| c.network.eq_ignore_ascii_case(n))
                    && channel.is_none_or(|ch| c.channel.eq_ignore_ascii_case(ch))
            })
            .map(|c| c.handle)
    }

    fn get_context(&self) -> ContextHandle {
        self.state.lock().current
    }

    fn set_context(&self, handle: ContextHandle) -> bool {
        let mut state = self.state.lock();
        if state.contexts.iter().any(|c| c.handle == handle) {
            state.current = handle;
            true
        } else {
            false
        }
    }

    fn hook(&self, kind: HookKind, name: &str, priority: i32, cb: HostHookFn) -> HostHookToken {
        let mut state = self.state.lock();
        let token = HostHookToken(state.next_id);
        state.next_id += 1;
        state.hooks.push(HostHook {
            token,
            kind,
            name: name.to_string(),
            priority,
            cb: Arc::from(cb),
        });
        token
    }

    fn unhook(&self, token: HostHookToken) {
        self.state.lock().hooks.retain(|h| h.token != token);
    }

    fn list_fields(&self, name: &str) -> Option<Vec<(String, char)>> {
        match name {
            "channels" => Some(vec![
                ("channel".to_string(), 's'),
                ("network".to_string(), 's'),
                ("context".to_string(), 'p'),
                ("type".to_string(), 'i'),
                ("users".to_string(), 'i'),
            ]),
            "users" => Some(vec![
                ("nick".to_string(), 's'),
                ("host".to_string(), 's'),
                ("prefix".to_string(), 's'),
                ("away".to_string(), 'i'),
                ("lasttalk".to_string(), 't'),
                ("selected".to_string(), 'i'),
            ]),
            _ => None,
        }
    }

    fn list_open(&self, name: &str) -> Option<ListCursorId> {
        let rows = self.snapshot_rows(name)?;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.cursors.insert(id, Cursor { rows, pos: None });
        Some(ListCursorId(id))
    }

    fn list_next(&self, cursor: ListCursorId) -> bool {
        let mut state = self.state.lock();
        let Some(cursor) = state.cursors.get_mut(&cursor.0) else {
            return false;
        };
        let next = cursor.pos.map_or(0, |p| p + 1);
        if next < cursor.rows.len() {
            cursor.pos = Some(next);
            true
        } else {
            false
        }
    }

    fn list_close(&self, cursor: ListCursorId) {
        self.state.lock().cursors.remove(&cursor.0);
    }

    fn list_str(&self, cursor: ListCursorId, field: &str) -> Option<Vec<u8>> {
        match self.read_cell(cursor, field)? {
            Cell::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn list_int(&self, cursor: ListCursorId, field: &str) -> Option<i64> {
        match self.read_cell(cursor, field)? {
            Cell::Int(n) => Some(n),
            _ => None,
        }
    }

    fn list_time(&self, cursor: ListCursorId, field: &str) -> Option<i64> {
        match self.read_cell(cursor, field)? {
            Cell::Time(t) => Some(t),
            _ => None,
        }
    }

    fn list_ptr(&self, cursor: ListCursorId, field: &str) -> Option<u64> {
        match self.read_cell(cursor, field)? {
            Cell::Ptr(p) => Some(p),
            _ => None,
        }
    }

    fn set_pluginpref(&self, key: &str, value: PrefValue) -> bool {
        self.state
            .lock()
            .pluginprefs
            .insert(key.to_string(), value);
        true
    }

    fn get_pluginpref(&self, key: &str) -> Option<PrefValue> {
        self.state.lock().pluginprefs.get(key).cloned()
    }

    fn del_pluginpref(&self, key: &str) -> bool {
        self.state.lock().pluginprefs.remove(key).is_some()
    }

    fn list_pluginpref(&self) -> Vec<String> {
        self.state.lock().pluginprefs.keys().cloned().collect()
    }
}

// The scheduler binding and main-thread mark are process-global, so
// fixtures take turns.
static SERIAL: Mutex<()> = Mutex::new(());

pub struct Fixture {
    pub host: Arc<LoopbackHost>,
    pub registry: Arc<Registry>,
    pub executor: SimpleExecutor,
    _serial: MutexGuard<'static, ()>,
}

impl Fixture {
    /// Locks out other fixtures, installs a fresh executor as the
    /// scheduler, and marks the calling thread as main.
    pub fn new() -> Self {
        let serial = SERIAL.lock();
        let executor = SimpleExecutor::new();
        Self {
            host: LoopbackHost::new(),
            registry: Registry::new(),
            executor,
            _serial: serial,
        }
    }

    pub fn host_dyn(&self) -> Arc<dyn HostApi> {
        Arc::clone(&self.host) as Arc<dyn HostApi>
    }

    /// Create a plugin runtime and its API facade in one go.
    pub fn plugin(&self, name: &str) -> Arc<PluginApi> {
        let token = self.registry.create(name);
        PluginApi::new(self.host_dyn(), Arc::clone(&self.registry), token)
            .expect("fresh runtime cannot be gone")
    }

    /// Drain the main loop.
    pub fn pump(&self) -> usize {
        self.executor.run_until_idle()
    }

    /// Run `f` on a worker thread while this thread keeps pumping the
    /// main loop, then hand back the worker's result.
    pub fn run_worker<R: Send + 'static>(&self, f: impl FnOnce() -> R + Send + 'static) -> R {
        let worker = std::thread::spawn(f);
        let deadline = Instant::now() + Duration::from_secs(10);
        while !worker.is_finished() {
            if self.pump() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(Instant::now() < deadline, "worker did not finish in time");
        }
        self.pump();
        worker.join().expect("worker panicked")
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_contexts_and_transcripts() {
        let fx = Fixture::new();
        let extra = fx.host.add_context("oftc", "#test");
        assert!(fx.host.set_context(extra));
        fx.host.print("in extra");
        assert_eq!(fx.host.transcript(extra), vec!["in extra".to_string()]);

        fx.host.remove_context(extra);
        assert!(!fx.host.set_context(extra));
    }

    #[test]
    fn loopback_nickcmp_folds_rfc_brackets() {
        let fx = Fixture::new();
        assert_eq!(fx.host.nickcmp("Nick{a}", "nick[A]"), 0);
        assert_eq!(fx.host.nickcmp("abc", "abd"), -1);
    }

    #[test]
    fn loopback_cursor_walks_snapshot() {
        let fx = Fixture::new();
        fx.host.add_context("libera", "#cursor");
        let cursor = fx.host.list_open("channels").unwrap();
        let mut rows = 0;
        while fx.host.list_next(cursor) {
            rows += 1;
            assert!(fx.host.list_str(cursor, "channel").is_some());
        }
        assert_eq!(rows, 2);
        fx.host.list_close(cursor);
        assert!(!fx.host.list_next(cursor));
    }

    #[test]
    fn run_worker_pumps_the_main_loop() {
        let fx = Fixture::new();
        let value = fx.run_worker(|| {
            let (tx, rx) = relay_dispatch::slot::pair();
            enqueue_on_main(Box::new(move || {
                tx.send(21).ok();
            }));
            rx.take().unwrap() * 2
        });
        assert_eq!(value, 42);
    }
}
