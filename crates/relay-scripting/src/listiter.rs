//! Row-by-row access to the host's data lists.
//!
//! The host exposes lists ("channels", "users", ...) through a cursor API
//! with per-field typed accessors. A [`ListIter`] owns one cursor, decodes
//! fields through the owning runtime's cached schema, and closes the
//! cursor on drop. Everything here is main-thread-only; a worker gets at
//! list data through a delegate like everything else.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::host::{FieldType, HostApi, ListCursorId};
use crate::runtime::{ListSchema, Registry, RuntimeToken, main_thread_check};
use crate::value::{CallableRef, ObjectRef, ScriptValue};

/// Fetch the schema for `list`, consulting the runtime's cache first.
pub fn schema_for(
    host: &dyn HostApi,
    registry: &Registry,
    runtime: RuntimeToken,
    list: &str,
) -> ScriptResult<ListSchema> {
    let state = registry.get(runtime).ok_or_else(ScriptError::runtime_gone)?;
    if let Some(cached) = state.store.lock().schema(list) {
        return Ok(cached);
    }
    let fields = host.list_fields(list).ok_or_else(|| {
        ScriptError::new(ErrorKind::UnknownListType, format!("no list named {list:?}"))
    })?;
    let schema = ListSchema { fields };
    state.store.lock().cache_schema(list, schema.clone());
    Ok(schema)
}

pub struct ListIter {
    list: String,
    cursor: ListCursorId,
    started: bool,
    schema: ListSchema,
    host: Arc<dyn HostApi>,
}

impl std::fmt::Debug for ListIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListIter")
            .field("list", &self.list)
            .field("cursor", &self.cursor)
            .field("started", &self.started)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl ListIter {
    pub fn open(
        host: Arc<dyn HostApi>,
        registry: &Registry,
        runtime: RuntimeToken,
        list: &str,
    ) -> ScriptResult<Self> {
        main_thread_check("list iteration")?;
        let schema = schema_for(host.as_ref(), registry, runtime, list)?;
        let cursor = host.list_open(list).ok_or_else(|| {
            ScriptError::new(ErrorKind::UnknownListType, format!("no list named {list:?}"))
        })?;
        Ok(Self {
            list: list.to_string(),
            cursor,
            started: false,
            schema,
            host,
        })
    }

    pub fn schema(&self) -> &ListSchema {
        &self.schema
    }

    /// Advance to the next row. Returns false past the end.
    pub fn next_row(&mut self) -> ScriptResult<bool> {
        main_thread_check("list iteration")?;
        let advanced = self.host.list_next(self.cursor);
        if advanced {
            self.started = true;
        }
        Ok(advanced)
    }

    /// Read one field of the current row, decoded per the schema's type
    /// code. The single known pointer field, the channel list's `context`,
    /// comes back as a context handle.
    pub fn field(&self, name: &str) -> ScriptResult<ScriptValue> {
        main_thread_check("list field access")?;
        if !self.started {
            return Err(ScriptError::bad_argument(format!(
                "no current row in list {:?}; call next() first",
                self.list
            )));
        }
        let code = self.schema.lookup(name).ok_or_else(|| {
            ScriptError::new(
                ErrorKind::UnknownField,
                format!("list {:?} has no field {name:?}", self.list),
            )
        })?;
        let ty = FieldType::from_code(code).ok_or_else(|| {
            ScriptError::new(
                ErrorKind::UnsupportedFieldType,
                format!("field {name:?} has unsupported type code {code:?}"),
            )
        })?;
        Ok(match ty {
            // Host strings are raw bytes; undecodable sequences become
            // replacement characters rather than an error.
            FieldType::Str => match self.host.list_str(self.cursor, name) {
                Some(bytes) => ScriptValue::Str(String::from_utf8_lossy(&bytes).into_owned()),
                None => ScriptValue::Null,
            },
            FieldType::Int => {
                ScriptValue::Int(self.host.list_int(self.cursor, name).unwrap_or(0))
            }
            FieldType::Time => {
                ScriptValue::Int(self.host.list_time(self.cursor, name).unwrap_or(0))
            }
            FieldType::Ptr => {
                if name == "context" {
                    match self.host.list_ptr(self.cursor, name) {
                        Some(raw) => ScriptValue::Context(crate::host::ContextHandle(raw)),
                        None => ScriptValue::Null,
                    }
                } else {
                    return Err(ScriptError::new(
                        ErrorKind::UnsupportedFieldType,
                        format!("pointer field {name:?} has no script representation"),
                    ));
                }
            }
        })
    }

    /// Snapshot the current row into an attribute bag.
    pub fn row_object(&self) -> ScriptResult<ObjectRef> {
        let row = ObjectRef::new("ListRow");
        let names: Vec<String> = self.schema.names().map(str::to_string).collect();
        for name in names {
            match self.field(&name) {
                Ok(value) => row.set(name, value),
                // Rows keep what decodes; an exotic field should not make
                // the whole list unreadable.
                Err(err) if err.kind == ErrorKind::UnsupportedFieldType => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(row)
    }

    /// Expose the iterator to scripts as an object with a `next` callable.
    /// Each successful advance refreshes the row's fields onto the object,
    /// so attribute reads see the current row.
    pub fn into_object(self) -> ObjectRef {
        let obj = ObjectRef::new("ListIter");
        let shared = Arc::new(Mutex::new(self));
        let target = obj.clone();
        obj.set(
            "next",
            ScriptValue::Callable(CallableRef::new(move |_| {
                let mut iter = shared.lock();
                let advanced = iter.next_row()?;
                if advanced {
                    let row = iter.row_object()?;
                    for name in row.attr_names() {
                        if let Some(value) = row.get(&name) {
                            target.set(name, value);
                        }
                    }
                }
                Ok(ScriptValue::Bool(advanced))
            })),
        );
        obj
    }
}

impl Drop for ListIter {
    fn drop(&mut self) {
        self.host.list_close(self.cursor);
    }
}

/// Materialize a whole list as row objects.
pub fn read_list(
    host: Arc<dyn HostApi>,
    registry: &Registry,
    runtime: RuntimeToken,
    list: &str,
) -> ScriptResult<Vec<ObjectRef>> {
    let mut iter = ListIter::open(host, registry, runtime, list)?;
    let mut rows = Vec::new();
    while iter.next_row()? {
        rows.push(iter.row_object()?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn unknown_list_name_is_reported() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let err = ListIter::open(fx.host_dyn(), &fx.registry, token, "bogus").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownListType);
    }

    #[test]
    fn field_before_first_next_is_rejected() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let iter = ListIter::open(fx.host_dyn(), &fx.registry, token, "channels").unwrap();
        let err = iter.field("channel").unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadArgument);
        assert!(err.message.contains("next()"));
    }

    #[test]
    fn channels_list_decodes_fields_by_type() {
        let fx = Fixture::new();
        fx.host.add_context("libera", "#rust");
        let token = fx.registry.create("demo");
        let mut iter = ListIter::open(fx.host_dyn(), &fx.registry, token, "channels").unwrap();

        let mut saw_rust = false;
        while iter.next_row().unwrap() {
            let channel = iter.field("channel").unwrap();
            if channel == ScriptValue::str("#rust") {
                saw_rust = true;
                assert_eq!(iter.field("network").unwrap(), ScriptValue::str("libera"));
                assert!(matches!(
                    iter.field("context").unwrap(),
                    ScriptValue::Context(_)
                ));
                assert!(matches!(iter.field("users").unwrap(), ScriptValue::Int(_)));
            }
        }
        assert!(saw_rust);
    }

    #[test]
    fn unknown_field_is_distinct_from_unknown_list() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let mut iter = ListIter::open(fx.host_dyn(), &fx.registry, token, "channels").unwrap();
        assert!(iter.next_row().unwrap());
        let err = iter.field("no_such_field").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownField);
    }

    #[test]
    fn schema_is_cached_per_runtime() {
        let fx = Fixture::new();
        let token = fx.registry.create("demo");
        let first = schema_for(fx.host.as_ref(), &fx.registry, token, "users").unwrap();
        // Second fetch comes from the store cache.
        let state = fx.registry.get(token).unwrap();
        assert_eq!(state.store.lock().schema("users"), Some(first.clone()));
        let second = schema_for(fx.host.as_ref(), &fx.registry, token, "users").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn read_list_materializes_rows() {
        let fx = Fixture::new();
        fx.host.add_context("libera", "#one");
        fx.host.add_context("libera", "#two");
        let token = fx.registry.create("demo");
        let rows = read_list(fx.host_dyn(), &fx.registry, token, "channels").unwrap();
        assert!(rows.len() >= 2);
        assert!(rows.iter().all(|r| r.get("channel").is_some()));
    }

    #[test]
    fn script_facing_iterator_refreshes_rows() {
        let fx = Fixture::new();
        fx.host.add_context("libera", "#script");
        let token = fx.registry.create("demo");
        let iter = ListIter::open(fx.host_dyn(), &fx.registry, token, "channels").unwrap();
        let obj = iter.into_object();

        let next = obj.get("next").unwrap();
        let mut channels = Vec::new();
        while next.invoke(crate::value::CallArgs::none()).unwrap() == ScriptValue::Bool(true) {
            channels.push(obj.get("channel").unwrap());
        }
        assert!(channels.contains(&ScriptValue::str("#script")));
    }
}
