/// Lua script sandbox for condition and transformer nodes
///
/// Every call builds a fresh interpreter on the blocking pool, so no globals survive
/// between invocations. Only the `table`, `string`, `math` and `utf8` libraries are
/// loaded, code-loading builtins are removed and reading an undefined global raises.
/// A wall-clock deadline is enforced from an instruction hook, backed by an outer
/// `tokio::time::timeout`.

use crate::config::SandboxConfig;
use crate::runtime::error::ScriptError;
use crate::workflow::types::WorkflowEvent;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

const CONDITION_ENTRY: &str = "condition";
const TRANSFORMER_ENTRY: &str = "transformer";

/// Instructions between deadline checks
const HOOK_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Slack granted to the outer timeout over the in-VM deadline
const OUTER_GRACE: Duration = Duration::from_millis(250);

/// Base-library functions that could load code or reach the host
const BLOCKED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "require",
    "collectgarbage",
    "print",
];

const STRICT_GLOBALS: &str = r#"
setmetatable(_G, {
    __index = function(_, key)
        error("access to undefined global '" .. tostring(key) .. "'", 2)
    end,
    __metatable = false,
})
"#;

/// Stateless script runner; clones share nothing but their limits
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    timeout: Duration,
    memory_limit: usize,
}

impl ScriptSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout(),
            memory_limit: config.memory_limit_bytes,
        }
    }

    /// Run `condition(event)` and return its Lua truthiness
    pub async fn evaluate_condition(
        &self,
        script: &str,
        event: &WorkflowEvent,
    ) -> Result<bool, ScriptError> {
        self.invoke(script, CONDITION_ENTRY, event, |_, value| {
            Ok(!matches!(value, mlua::Value::Nil | mlua::Value::Boolean(false)))
        })
        .await
    }

    /// Run `transformer(event)`
    ///
    /// `nil` means drop the event. A returned table shaped like an event (it has a
    /// `data` key and deserializes as one) replaces the event; anything else becomes
    /// the `data` of a copy of the input.
    pub async fn evaluate_transformer(
        &self,
        script: &str,
        event: &WorkflowEvent,
    ) -> Result<Option<WorkflowEvent>, ScriptError> {
        let returned = self
            .invoke(script, TRANSFORMER_ENTRY, event, |lua, value| match value {
                mlua::Value::Nil => Ok(None),
                other => lua
                    .from_value::<Value>(other)
                    .map(Some)
                    .map_err(serialization_error),
            })
            .await?;

        Ok(match returned {
            None | Some(Value::Null) => None,
            Some(value) => Some(into_event(event, value)),
        })
    }

    async fn invoke<T, F>(
        &self,
        script: &str,
        entry_point: &'static str,
        event: &WorkflowEvent,
        convert: F,
    ) -> Result<T, ScriptError>
    where
        T: Send + 'static,
        F: FnOnce(&Lua, mlua::Value) -> Result<T, ScriptError> + Send + 'static,
    {
        let sandbox = self.clone();
        let script = script.to_string();
        let event = event.clone();
        let task = tokio::task::spawn_blocking(move || {
            sandbox.invoke_blocking(&script, entry_point, &event, convert)
        });

        match tokio::time::timeout(self.timeout + OUTER_GRACE, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ScriptError::RuntimeFault {
                message: format!("sandbox task aborted: {join_error}"),
            }),
            Err(_) => {
                tracing::warn!("⏱️ Script '{}' overran the outer sandbox deadline", entry_point);
                Err(self.timeout_error())
            }
        }
    }

    fn invoke_blocking<T, F>(
        &self,
        script: &str,
        entry_point: &'static str,
        event: &WorkflowEvent,
        convert: F,
    ) -> Result<T, ScriptError>
    where
        F: FnOnce(&Lua, mlua::Value) -> Result<T, ScriptError>,
    {
        let lua = self.isolated_state()?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + self.timeout;
        let flag = Arc::clone(&timed_out);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
            move |_, _| {
                if Instant::now() >= deadline {
                    flag.store(true, Ordering::SeqCst);
                    Err(mlua::Error::RuntimeError("script execution timed out".to_string()))
                } else {
                    Ok(VmState::Continue)
                }
            },
        )
        .map_err(runtime_fault)?;

        let outcome = self.call_entry_point(&lua, script, entry_point, event);
        if timed_out.load(Ordering::SeqCst) {
            return Err(self.timeout_error());
        }
        let value = outcome?;
        convert(&lua, value)
    }

    fn call_entry_point(
        &self,
        lua: &Lua,
        script: &str,
        entry_point: &'static str,
        event: &WorkflowEvent,
    ) -> Result<mlua::Value, ScriptError> {
        lua.load(script)
            .set_name(format!("={entry_point}"))
            .exec()
            .map_err(runtime_fault)?;

        let function = match lua
            .globals()
            .raw_get::<mlua::Value>(entry_point)
            .map_err(runtime_fault)?
        {
            mlua::Value::Function(function) => function,
            _ => return Err(ScriptError::MissingEntryPoint { entry_point }),
        };

        let options = SerializeOptions::new()
            .serialize_none_to_null(false)
            .serialize_unit_to_null(false);
        let argument = lua
            .to_value_with(event, options)
            .map_err(serialization_error)?;

        function.call::<mlua::Value>(argument).map_err(runtime_fault)
    }

    /// Fresh interpreter with the restricted library set
    fn isolated_state(&self) -> Result<Lua, ScriptError> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(runtime_fault)?;
        lua.set_memory_limit(self.memory_limit).map_err(runtime_fault)?;

        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals.raw_set(*name, mlua::Value::Nil).map_err(runtime_fault)?;
        }
        lua.load(STRICT_GLOBALS)
            .set_name("=sandbox")
            .exec()
            .map_err(runtime_fault)?;

        Ok(lua)
    }

    fn timeout_error(&self) -> ScriptError {
        ScriptError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }
}

fn into_event(input: &WorkflowEvent, value: Value) -> WorkflowEvent {
    if value.get("data").is_some() {
        if let Ok(event) = serde_json::from_value::<WorkflowEvent>(value.clone()) {
            return event;
        }
    }
    input.with_data(value)
}

fn runtime_fault(e: mlua::Error) -> ScriptError {
    ScriptError::RuntimeFault { message: e.to_string() }
}

fn serialization_error(e: mlua::Error) -> ScriptError {
    ScriptError::Serialization { message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> ScriptSandbox {
        ScriptSandbox::new(&SandboxConfig {
            timeout_ms: 200,
            memory_limit_bytes: 8 * 1024 * 1024,
        })
    }

    fn event(data: Value) -> WorkflowEvent {
        WorkflowEvent::new(data).with_metadata("loop_iteration", 2)
    }

    #[tokio::test]
    async fn condition_reads_event_fields() {
        let script = r#"function condition(event) return event.data.status == "done" end"#;
        let sandbox = sandbox();
        assert!(sandbox.evaluate_condition(script, &event(json!({"status": "done"}))).await.unwrap());
        assert!(!sandbox.evaluate_condition(script, &event(json!({"status": "pending"}))).await.unwrap());
    }

    #[tokio::test]
    async fn condition_uses_lua_truthiness() {
        let script = r#"function condition(event) return tonumber(event.metadata.loop_iteration) end"#;
        assert!(sandbox().evaluate_condition(script, &event(json!(null))).await.unwrap());
    }

    #[tokio::test]
    async fn missing_entry_point_is_reported() {
        let err = sandbox()
            .evaluate_condition("function transformer(event) return event end", &event(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, ScriptError::MissingEntryPoint { entry_point: "condition" });
    }

    #[tokio::test]
    async fn runaway_script_times_out() {
        let script = "function condition(event) while true do end end";
        let err = sandbox().evaluate_condition(script, &event(json!({}))).await.unwrap_err();
        assert!(matches!(err, ScriptError::Timeout { timeout_ms: 200 }));
    }

    #[tokio::test]
    async fn host_access_fails_fast() {
        for script in [
            r#"function condition(event) return os.execute("true") end"#,
            r#"function condition(event) return io.open("/etc/passwd") end"#,
            r#"function condition(event) return load("return 1")() end"#,
            r#"function condition(event) return require("socket") end"#,
        ] {
            let err = sandbox().evaluate_condition(script, &event(json!({}))).await.unwrap_err();
            assert!(matches!(err, ScriptError::RuntimeFault { .. }), "{script}: {err:?}");
        }
    }

    #[tokio::test]
    async fn syntax_errors_are_runtime_faults() {
        let err = sandbox()
            .evaluate_condition("function condition(event) return end end", &event(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::RuntimeFault { .. }));
    }

    #[tokio::test]
    async fn globals_do_not_leak_between_calls() {
        let sandbox = sandbox();
        let first = "counter = 41\nfunction condition(event) return counter == 41 end";
        assert!(sandbox.evaluate_condition(first, &event(json!({}))).await.unwrap());

        let second = "function condition(event) return counter ~= nil end";
        let err = sandbox.evaluate_condition(second, &event(json!({}))).await.unwrap_err();
        assert!(matches!(err, ScriptError::RuntimeFault { message } if message.contains("counter")));
    }

    #[tokio::test]
    async fn transformer_nil_drops_event() {
        let script = "function transformer(event) return nil end";
        assert_eq!(sandbox().evaluate_transformer(script, &event(json!({}))).await.unwrap(), None);
    }

    #[tokio::test]
    async fn transformer_plain_value_becomes_data() {
        let script = "function transformer(event) return { total = event.data.a + event.data.b } end";
        let input = event(json!({"a": 2, "b": 3}));
        let output = sandbox().evaluate_transformer(script, &input).await.unwrap().unwrap();
        assert_eq!(output.data, json!({"total": 5}));
        assert_eq!(output.metadata, input.metadata);
    }

    #[tokio::test]
    async fn transformer_can_return_whole_event() {
        let script = r#"
            function transformer(event)
                event.metadata.stage = "enriched"
                event.data.items = { "a", "b" }
                return event
            end
        "#;
        let output = sandbox()
            .evaluate_transformer(script, &event(json!({"id": 7})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.data, json!({"id": 7, "items": ["a", "b"]}));
        assert_eq!(output.metadata.get("stage").map(String::as_str), Some("enriched"));
        assert_eq!(output.metadata.get("loop_iteration").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn non_serializable_return_is_a_serialization_error() {
        let script = "function transformer(event) return { f = function() end } end";
        let err = sandbox().evaluate_transformer(script, &event(json!({}))).await.unwrap_err();
        assert!(matches!(err, ScriptError::Serialization { .. }));
    }
}
