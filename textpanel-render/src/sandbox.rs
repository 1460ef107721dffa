//! Luau script host for user-supplied panel code.
//!
//! User code is compiled into a function with a single `context` parameter.
//! It may return:
//! - a function: the teardown, run once before the next pass or on unmount;
//! - a coroutine (`coroutine.create(...)`): pending work, resumed until it
//!   finishes, whose final return value is treated the same way;
//! - anything else: no teardown.
//!
//! One Lua state per panel, sandboxed, with a memory limit and a per-call
//! instruction budget enforced by the interrupt.

use crate::error::{RenderError, RenderResult};
use crate::host::{EventBus, EventHandler, HostServices};
use crate::markdown;
use crate::options::SandboxLimits;
use mlua::{
    Function, IntoLua, Lua, LuaSerdeExt, SerializeOptions, Table, Thread, ThreadStatus, Value,
    VmState,
};
use serde_json::Map;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which configured code a compiled function came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CodeKind {
    BeforeRender,
    AfterRender,
}

impl CodeKind {
    fn chunk_name(self) -> &'static str {
        match self {
            CodeKind::BeforeRender => "=helpers",
            CodeKind::AfterRender => "=after_render",
        }
    }
}

/// A compile failure, surfaced instead of aborting the render pass.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Diagnostic {
    pub kind: CodeKind,
    pub message: String,
    pub code: String,
}

/// Instruction budget shared with the interrupt callback.
#[derive(Clone)]
struct Budget {
    remaining: Arc<AtomicU64>,
    limit: u64,
}

impl Budget {
    fn refill(&self) {
        self.remaining.store(self.limit, Ordering::Relaxed);
    }
}

/// Partials and globals registered by pre-render code for the current call.
#[derive(Debug, Clone, Default)]
pub struct HelperRegistrations {
    pub partials: Vec<(String, String)>,
    pub globals: Map<String, serde_json::Value>,
}

/// Target element handed to post-render code.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    pub id: String,
    pub html: String,
}

/// Per-invocation view handed to user code. Converted into a fresh Lua
/// table on every call; nothing of it survives the call.
pub struct SandboxContext<'a> {
    pub data: &'a serde_json::Value,
    pub data_frame: &'a serde_json::Value,
    pub panel_data: &'a serde_json::Value,
    pub host: &'a HostServices,
    pub element: Option<ElementInfo>,
    /// Present for pre-render code only.
    pub registrations: Option<Arc<Mutex<HelperRegistrations>>>,
    pub wrap: bool,
}

/// Cleanup returned by user code. Consumed by `run`, so it runs at most once.
pub struct Teardown(Box<dyn FnOnce()>);

impl Teardown {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Box::new(f))
    }

    fn from_lua(function: Function, budget: Budget) -> Self {
        Self::new(move || {
            budget.refill();
            if let Err(err) = function.call::<()>(()) {
                tracing::warn!(error = %err, "teardown callback failed");
            }
        })
    }

    pub fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Teardown")
    }
}

/// Composite teardown of one render pass. Runs every handle exactly once,
/// either through `run` or when dropped.
#[derive(Debug, Default)]
pub struct TeardownSet {
    handles: Vec<Teardown>,
}

impl TeardownSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, teardown: Option<Teardown>) {
        if let Some(teardown) = teardown {
            self.handles.push(teardown);
        }
    }

    pub fn append(&mut self, mut other: TeardownSet) {
        self.handles.append(&mut other.handles);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn run(mut self) {
        self.run_all();
    }

    fn run_all(&mut self) {
        for teardown in self.handles.drain(..) {
            teardown.run();
        }
    }
}

impl Drop for TeardownSet {
    fn drop(&mut self) {
        self.run_all();
    }
}

/// Outcome of one call into user code.
#[derive(Debug)]
pub enum Completion {
    Ready(Option<Teardown>),
    Pending(PendingScript),
}

impl Completion {
    /// Waits for pending work and yields the teardown, if any.
    pub async fn settle(self) -> RenderResult<Option<Teardown>> {
        match self {
            Completion::Ready(teardown) => Ok(teardown),
            Completion::Pending(pending) => pending.settle().await,
        }
    }
}

/// A coroutine returned by user code; the promise of this host.
pub struct PendingScript {
    thread: Thread,
    budget: Budget,
}

impl fmt::Debug for PendingScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingScript")
            .field("status", &self.thread.status())
            .finish()
    }
}

impl PendingScript {
    /// Resumes the coroutine until it finishes, yielding to the executor in
    /// between. A coroutine that never finishes never settles.
    pub async fn settle(self) -> RenderResult<Option<Teardown>> {
        loop {
            match self.thread.status() {
                ThreadStatus::Resumable => {
                    self.budget.refill();
                    let value: Value = self.thread.resume(())?;
                    if self.thread.status() == ThreadStatus::Finished {
                        return Ok(teardown_from(value, &self.budget));
                    }
                    tokio::task::yield_now().await;
                }
                ThreadStatus::Running => tokio::task::yield_now().await,
                ThreadStatus::Finished => return Ok(None),
                ThreadStatus::Error => {
                    return Err(RenderError::Script {
                        message: "pending script failed".to_string(),
                        traceback: String::new(),
                    })
                }
            }
        }
    }
}

fn teardown_from(value: Value, budget: &Budget) -> Option<Teardown> {
    match value {
        Value::Function(function) => Some(Teardown::from_lua(function, budget.clone())),
        _ => None,
    }
}

/// User code compiled against a `ScriptHost`. A failed compile yields the
/// no-op variant so call sites never special-case missing code.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    kind: CodeKind,
    function: Option<Function>,
}

impl CompiledCode {
    pub fn noop(kind: CodeKind) -> Self {
        Self { kind, function: None }
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn is_noop(&self) -> bool {
        self.function.is_none()
    }

    /// Calls the code with a fresh context. Errors raised by the code
    /// propagate unchanged.
    pub fn call(&self, host: &ScriptHost, context: &SandboxContext<'_>) -> RenderResult<Completion> {
        let Some(function) = &self.function else {
            return Ok(Completion::Ready(None));
        };
        let table = host
            .context_table(context)
            .map_err(|e| RenderError::ScriptHost(e.to_string()))?;
        host.budget.refill();
        let value: Value = function.call(table)?;
        Ok(match value {
            Value::Thread(thread) => Completion::Pending(PendingScript {
                thread,
                budget: host.budget.clone(),
            }),
            other => Completion::Ready(teardown_from(other, &host.budget)),
        })
    }
}

fn json_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

/// JSON payload converted to a Lua value at call time.
struct JsonArg(serde_json::Value);

impl IntoLua for JsonArg {
    fn into_lua(self, lua: &Lua) -> mlua::Result<Value> {
        lua.to_value_with(&self.0, json_options())
    }
}

/// Creates the sandboxed Lua state: read-only globals, blocked host
/// access, memory limit, instruction budget.
fn create_sandbox_lua(limits: SandboxLimits, budget: &Budget) -> Result<Lua, mlua::Error> {
    let lua = Lua::new();
    lua.sandbox(true)?;

    for name in ["io", "os", "require", "loadfile", "dofile", "debug"] {
        let msg = format!("{} is not available in panel code", name);
        lua.globals().set(
            name,
            lua.create_function(move |_, _: mlua::MultiValue| {
                Err::<(), _>(mlua::Error::RuntimeError(msg.clone()))
            })?,
        )?;
    }

    let remaining = budget.remaining.clone();
    lua.set_interrupt(move |_| {
        if remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(mlua::Error::RuntimeError(
                "panel code exceeded its instruction budget".to_string(),
            ));
        }
        Ok(VmState::Continue)
    });

    lua.set_memory_limit(limits.memory_limit_bytes)?;
    Ok(lua)
}

pub struct ScriptHost {
    lua: Lua,
    budget: Budget,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl ScriptHost {
    pub fn new(limits: SandboxLimits) -> RenderResult<Self> {
        let budget = Budget {
            remaining: Arc::new(AtomicU64::new(limits.instruction_budget)),
            limit: limits.instruction_budget,
        };
        let lua = create_sandbox_lua(limits, &budget)
            .map_err(|e| RenderError::ScriptHost(e.to_string()))?;
        Ok(Self {
            lua,
            budget,
            diagnostics: Mutex::new(Vec::new()),
        })
    }

    /// Compiles `code` as the body of `function(context)`. Failures are
    /// logged and recorded as diagnostics, and produce a no-op.
    pub fn compile(&self, kind: CodeKind, code: &str) -> CompiledCode {
        if code.trim().is_empty() {
            return CompiledCode::noop(kind);
        }

        let source = format!("return function(context)\n{}\nend", code);
        self.budget.refill();
        match self
            .lua
            .load(&source)
            .set_name(kind.chunk_name())
            .eval::<Function>()
        {
            Ok(function) => CompiledCode {
                kind,
                function: Some(function),
            },
            Err(err) => {
                let message = err.to_string();
                tracing::error!(?kind, error = %message, code, "failed to compile panel code");
                self.diagnostics.lock().unwrap().push(Diagnostic {
                    kind,
                    message,
                    code: code.to_string(),
                });
                CompiledCode::noop(kind)
            }
        }
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }

    pub fn clear_diagnostics(&self) {
        self.diagnostics.lock().unwrap().clear();
    }

    fn context_table(&self, ctx: &SandboxContext<'_>) -> mlua::Result<Table> {
        let lua = &self.lua;
        let table = lua.create_table()?;
        table.set("data", lua.to_value_with(ctx.data, json_options())?)?;
        table.set("data_frame", lua.to_value_with(ctx.data_frame, json_options())?)?;
        table.set("panel_data", lua.to_value_with(ctx.panel_data, json_options())?)?;

        if let Some(element) = &ctx.element {
            let el = lua.create_table()?;
            el.set("id", element.id.as_str())?;
            el.set("html", element.html.as_str())?;
            table.set("element", el)?;
        }

        table.set("host", self.host_table(ctx.host)?)?;

        if let Some(registrations) = &ctx.registrations {
            table.set("template", self.template_table(registrations.clone())?)?;
            let md = lua.create_table()?;
            let wrap = ctx.wrap;
            md.set(
                "render",
                lua.create_function(move |_, text: String| Ok(markdown::render_markdown(&text, wrap)))?,
            )?;
            table.set("markdown", md)?;
        }

        Ok(table)
    }

    fn host_table(&self, host: &HostServices) -> mlua::Result<Table> {
        let lua = &self.lua;
        let t = lua.create_table()?;

        let interpolator = host.interpolator.clone();
        t.set(
            "replace_variables",
            lua.create_function(move |_, text: String| Ok(interpolator.replace_variables(&text)))?,
        )?;
        let interpolator = host.interpolator.clone();
        t.set(
            "variable",
            lua.create_function(move |_, name: String| {
                Ok(crate::helpers::variable_values(interpolator.as_ref(), &name))
            })?,
        )?;

        let notifier = host.notifier.clone();
        t.set(
            "notify_success",
            lua.create_function(move |_, message: String| {
                notifier.notify_success(&message);
                Ok(())
            })?,
        )?;
        let notifier = host.notifier.clone();
        t.set(
            "notify_error",
            lua.create_function(move |_, message: String| {
                notifier.notify_error(&message);
                Ok(())
            })?,
        )?;

        let locale = host.locale.clone();
        t.set("get_locale", lua.create_function(move |_, ()| Ok(locale.clone()))?)?;
        t.set("time_zone", host.time_zone.as_str())?;

        let range = lua.create_table()?;
        range.set("from", host.time_range.from.timestamp_millis())?;
        range.set("to", host.time_range.to.timestamp_millis())?;
        t.set("time_range", range)?;

        t.set("event_bus", self.event_bus_table(host.event_bus.clone())?)?;

        let location = lua.create_table()?;
        let service = host.location.clone();
        location.set("path", lua.create_function(move |_, ()| Ok(service.path()))?)?;
        let service = host.location.clone();
        location.set(
            "push",
            lua.create_function(move |_, path: String| {
                service.push(&path);
                Ok(())
            })?,
        )?;
        let service = host.location.clone();
        location.set(
            "partial",
            lua.create_function(move |_, query: BTreeMap<String, String>| {
                service.partial(&query);
                Ok(())
            })?,
        )?;
        t.set("location", location)?;

        Ok(t)
    }

    fn event_bus_table(&self, bus: Arc<dyn EventBus>) -> mlua::Result<Table> {
        let lua = &self.lua;
        let t = lua.create_table()?;

        let publisher = bus.clone();
        t.set(
            "publish",
            lua.create_function(move |lua, (event_type, payload): (String, Option<Value>)| {
                let payload: serde_json::Value = match payload {
                    Some(value) => lua.from_value(value)?,
                    None => serde_json::Value::Null,
                };
                publisher.publish(&event_type, &payload);
                Ok(())
            })?,
        )?;

        let budget = self.budget.clone();
        t.set(
            "subscribe",
            lua.create_function(move |lua, (event_type, callback): (String, Function)| {
                let handler_budget = budget.clone();
                let handler: EventHandler = Arc::new(move |payload: &serde_json::Value| {
                    handler_budget.refill();
                    if let Err(err) = callback.call::<()>(JsonArg(payload.clone())) {
                        tracing::warn!(error = %err, "event handler failed");
                    }
                });
                let id = bus.subscribe(&event_type, handler);

                let unsubscribe_bus = bus.clone();
                let done = AtomicBool::new(false);
                lua.create_function(move |_, ()| {
                    if !done.swap(true, Ordering::Relaxed) {
                        unsubscribe_bus.unsubscribe(id);
                    }
                    Ok(())
                })
            })?,
        )?;

        Ok(t)
    }

    fn template_table(&self, registrations: Arc<Mutex<HelperRegistrations>>) -> mlua::Result<Table> {
        let lua = &self.lua;
        let t = lua.create_table()?;

        let partials = registrations.clone();
        t.set(
            "register_partial",
            lua.create_function(move |_, (name, content): (String, String)| {
                partials.lock().unwrap().partials.push((name, content));
                Ok(())
            })?,
        )?;

        t.set(
            "set_global",
            lua.create_function(move |lua, (name, value): (String, Value)| {
                let value: serde_json::Value = lua.from_value(value)?;
                registrations.lock().unwrap().globals.insert(name, value);
                Ok(())
            })?,
        )?;

        Ok(t)
    }
}
