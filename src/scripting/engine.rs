//! Rhai Script Executor
//!
//! Each invocation gets its own [`Engine`] bound to that invocation's maps
//! and logger, so destinations running on different threads never share
//! transient state. Compiled scripts are cached and shared.

use crate::codec::Message;
use crate::scripting::{
    MapScope, SandboxLimits, ScopedMaps, ScriptCache, ScriptError, ScriptExecutor, ScriptResult, ScriptValue,
    SharedScriptCache, Stage, StageContext,
};
use rhai::packages::{Package, StandardPackage};
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

const MESSAGE_VAR: &str = "msg";
const MESSAGE_ALIAS: &str = "message";

/// Logger handed to scripts as `logger`
#[derive(Debug, Clone)]
struct ScriptLogger {
    channel: String,
    stage: Stage,
}

/// [`ScriptExecutor`] backed by Rhai
pub struct RhaiExecutor {
    /// Engine used for compilation only
    compiler: Engine,
    packages: StandardPackage,
    cache: SharedScriptCache,
    limits: SandboxLimits,
}

impl RhaiExecutor {
    /// Create an executor with default limits
    pub fn new() -> Self {
        Self::with_limits(SandboxLimits::default())
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        let mut compiler = Engine::new_raw();
        compiler.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);

        Self {
            compiler,
            packages: StandardPackage::new(),
            cache: Arc::new(RwLock::new(ScriptCache::new())),
            limits,
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Check that a script parses
    pub fn validate(&self, source: &str) -> ScriptResult<()> {
        self.compiler
            .compile(source)
            .map(|_| ())
            .map_err(|e| ScriptError::Invalid(e.to_string()))
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Build the engine for one invocation
    fn build_engine(&self, ctx: &StageContext) -> Engine {
        let mut engine = Engine::new_raw();
        self.packages.register_into_engine(&mut engine);
        Self::configure_engine(&mut engine, &self.limits, ctx);
        engine
    }

    /// Install limits, logging and map accessors
    fn configure_engine(engine: &mut Engine, limits: &SandboxLimits, ctx: &StageContext) {
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);

        if limits.timeout_ms > 0 {
            let budget = Duration::from_millis(limits.timeout_ms);
            let started = Instant::now();
            engine.on_progress(move |_| {
                if started.elapsed() > budget {
                    Some(Dynamic::from(format!("time budget of {}ms exceeded", budget.as_millis())))
                } else {
                    None
                }
            });
        }

        {
            let channel = ctx.channel_id.clone();
            let stage = ctx.stage;
            engine.on_print(move |text| tracing::info!(channel = %channel, %stage, "{}", text));
        }
        {
            let channel = ctx.channel_id.clone();
            let stage = ctx.stage;
            engine.on_debug(move |text, _, pos| tracing::debug!(channel = %channel, %stage, %pos, "{}", text));
        }

        engine
            .register_type_with_name::<ScriptLogger>("Logger")
            .register_fn("info", |l: &mut ScriptLogger, text: Dynamic| {
                tracing::info!(channel = %l.channel, stage = %l.stage, "{}", text)
            })
            .register_fn("warn", |l: &mut ScriptLogger, text: Dynamic| {
                tracing::warn!(channel = %l.channel, stage = %l.stage, "{}", text)
            })
            .register_fn("error", |l: &mut ScriptLogger, text: Dynamic| {
                tracing::error!(channel = %l.channel, stage = %l.stage, "{}", text)
            })
            .register_fn("trace", |l: &mut ScriptLogger, text: Dynamic| {
                tracing::debug!(channel = %l.channel, stage = %l.stage, "{}", text)
            });

        Self::register_maps(engine, &ctx.maps);
    }

    /// `name(key)` reads, `name(key, value)` writes and returns `value`
    fn register_maps(engine: &mut Engine, maps: &ScopedMaps) {
        for scope in MapScope::ALL {
            for &name in scope.accessors() {
                let map = maps.get(scope).clone();
                engine.register_fn(name, move |key: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                    match map.get(key) {
                        Some(value) => rhai::serde::to_dynamic(value),
                        None => Ok(Dynamic::UNIT),
                    }
                });

                let map = maps.get(scope).clone();
                engine.register_fn(
                    name,
                    move |key: &str, value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                        let stored: Value = rhai::serde::from_dynamic(&value)?;
                        map.put(key, stored);
                        Ok(value)
                    },
                );
            }
        }
    }

    fn build_scope(ctx: &StageContext, view: Dynamic) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push(MESSAGE_VAR, view.clone());
        scope.push(MESSAGE_ALIAS, view);
        scope.push(
            "logger",
            ScriptLogger {
                channel: ctx.channel_id.clone(),
                stage: ctx.stage,
            },
        );
        scope.push_constant("channel_id", ctx.channel_id.clone());
        scope.push_constant("channel_name", ctx.channel_name.clone());
        scope.push_constant("connector_name", ctx.connector_name.clone().unwrap_or_default());
        scope.push_constant("stage", ctx.stage.as_str().to_string());
        scope
    }

    fn compile(&self, source: &str) -> ScriptResult<rhai::AST> {
        if let Some(ast) = self.cache.read().unwrap_or_else(PoisonError::into_inner).peek(source) {
            return Ok(ast);
        }
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_compile(&self.compiler, source)
    }

    /// Map a Rhai failure onto the sandbox error kinds
    fn classify(&self, err: &EvalAltResult) -> ScriptError {
        match root_cause(err) {
            EvalAltResult::ErrorTooManyOperations(_) => {
                ScriptError::Halted(format!("operation budget of {} exceeded", self.limits.max_operations))
            }
            EvalAltResult::ErrorTerminated(reason, _) => ScriptError::Halted(reason.to_string()),
            EvalAltResult::ErrorParsing(..) => ScriptError::Invalid(err.to_string()),
            EvalAltResult::ErrorRuntime(value, _) => ScriptError::Thrown(value.to_string()),
            other => ScriptError::Thrown(other.to_string()),
        }
    }
}

impl Default for RhaiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RhaiExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiExecutor")
            .field("limits", &self.limits)
            .field("cache_size", &self.cache_len())
            .finish()
    }
}

impl ScriptExecutor for RhaiExecutor {
    fn execute(&self, script: &str, message: &mut Message, ctx: &StageContext) -> ScriptResult<ScriptValue> {
        let ast = self.compile(script)?;

        let original = message.to_view();
        let view = rhai::serde::to_dynamic(&original).map_err(|e| ScriptError::Conversion(e.to_string()))?;
        let engine = self.build_engine(ctx);
        let mut scope = Self::build_scope(ctx, view);

        let outcome = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);

        // The message is written back even when the script threw
        let written = read_back(&scope, &original)
            .and_then(|view| Message::from_view(&view, &message.segment_names()).map_err(|e| e.to_string()));

        match outcome {
            Ok(result) => {
                *message = written.map_err(ScriptError::Conversion)?;
                Ok(script_value(result, message))
            }
            Err(err) => {
                if let Ok(written) = written {
                    *message = written;
                }
                Err(self.classify(&err))
            }
        }
    }
}

/// The view scripts left behind; `message` only counts if `msg` is untouched
fn read_back(scope: &Scope, original: &Value) -> Result<Value, String> {
    let read = |name: &str| -> Result<Option<Value>, String> {
        scope
            .get_value::<Dynamic>(name)
            .map(|d| rhai::serde::from_dynamic::<Value>(&d).map_err(|e| e.to_string()))
            .transpose()
    };

    match (read(MESSAGE_VAR)?, read(MESSAGE_ALIAS)?) {
        (Some(msg), _) if msg != *original => Ok(msg),
        (_, Some(alias)) if alias != *original => Ok(alias),
        _ => Ok(original.clone()),
    }
}

fn script_value(result: Dynamic, current: &Message) -> ScriptValue {
    if result.is_unit() {
        return ScriptValue::Unit;
    }
    if let Ok(flag) = result.as_bool() {
        return ScriptValue::Bool(flag);
    }
    match rhai::serde::from_dynamic::<Value>(&result) {
        Ok(value) if Message::is_view(&value) => match Message::from_view(&value, &current.segment_names()) {
            Ok(message) => ScriptValue::Message(message),
            Err(_) => ScriptValue::Other(value),
        },
        Ok(Value::Null) => ScriptValue::Unit,
        Ok(value) => ScriptValue::Other(value),
        Err(_) => ScriptValue::Other(Value::String(result.to_string())),
    }
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Field};
    use serde_json::json;

    const ADT: &str = "MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230101120000||ADT^A01|123|P|2.3\rPID|1||12345^^^MRN||DOE^JOHN";

    fn context(stage: Stage) -> StageContext {
        StageContext::new("ch-1", "Sample", stage, ScopedMaps::isolated())
    }

    #[test]
    fn test_boolean_result() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        let value = executor
            .execute(r#"msg.HL7Message.MSH["MSH.9"] == "123""#, &mut msg, &context(Stage::Filter))
            .unwrap();
        assert_eq!(value, ScriptValue::Bool(true));
    }

    #[test]
    fn test_components_visible() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        let value = executor
            .execute(r#"msg.HL7Message.PID["PID.5"]["PID.5.2"]"#, &mut msg, &context(Stage::Filter))
            .unwrap();
        assert_eq!(value, ScriptValue::Other(json!("JOHN")));
    }

    #[test]
    fn test_message_mutated_in_place() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        executor
            .execute(
                r#"msg.HL7Message.MSH["MSH.CustomField"] = "Processed";"#,
                &mut msg,
                &context(Stage::Transformer),
            )
            .unwrap();
        assert_eq!(
            msg.segment("MSH").unwrap().field_by_key("MSH.CustomField"),
            Some(&Field::from("Processed"))
        );
        assert_eq!(msg.get("PID.3.1").as_deref(), Some("12345"));
    }

    #[test]
    fn test_alias_mutation() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        executor
            .execute(r#"message.HL7Message.PID["PID.1"] = "2";"#, &mut msg, &context(Stage::Transformer))
            .unwrap();
        assert_eq!(msg.get("PID.1").as_deref(), Some("2"));
    }

    #[test]
    fn test_returned_message_reported() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        let value = executor
            .execute(r#"#{ HL7Message: #{ MSH: #{ "MSH.1": "x" } } }"#, &mut msg, &context(Stage::Preprocessor))
            .unwrap();
        let returned = value.into_message().unwrap();
        assert_eq!(returned.segment_names(), vec!["MSH"]);
    }

    #[test]
    fn test_map_accessors() {
        let executor = RhaiExecutor::new();
        let ctx = context(Stage::Transformer);
        let mut msg = decode(ADT);

        let written = executor.execute(r#"g("count", 41) + 1"#, &mut msg, &ctx).unwrap();
        assert_eq!(written, ScriptValue::Other(json!(42)));
        assert_eq!(ctx.maps.get(MapScope::Global).get("count"), Some(json!(41)));

        let read = executor.execute(r#"global_map("count")"#, &mut msg, &ctx).unwrap();
        assert_eq!(read, ScriptValue::Other(json!(41)));

        let missing = executor.execute(r#"r("nothing")"#, &mut msg, &ctx).unwrap();
        assert_eq!(missing, ScriptValue::Unit);

        executor.execute(r#"co("who", channel_name); c("stage", stage);"#, &mut msg, &ctx).unwrap();
        assert_eq!(ctx.maps.get(MapScope::Connector).get("who"), Some(json!("Sample")));
        assert_eq!(ctx.maps.get(MapScope::Channel).get("stage"), Some(json!("transformer")));
    }

    #[test]
    fn test_maps_persist_across_invocations() {
        let executor = RhaiExecutor::new();
        let ctx = context(Stage::Transformer);
        let mut msg = decode(ADT);
        for _ in 0..3 {
            executor
                .execute(r#"let n = c("n") ?? 0; c("n", n + 1);"#, &mut msg, &ctx)
                .unwrap();
        }
        assert_eq!(ctx.maps.get(MapScope::Channel).get("n"), Some(json!(3)));
    }

    #[test]
    fn test_error_kinds() {
        let executor = RhaiExecutor::new();
        let ctx = context(Stage::Filter);
        let mut msg = decode(ADT);

        assert!(matches!(
            executor.execute("let = ;", &mut msg, &ctx),
            Err(ScriptError::Invalid(_))
        ));
        assert!(matches!(
            executor.execute(r#"throw "bad message""#, &mut msg, &ctx),
            Err(ScriptError::Thrown(reason)) if reason.contains("bad message")
        ));
        assert!(matches!(
            executor.execute("undefined_function()", &mut msg, &ctx),
            Err(ScriptError::Thrown(_))
        ));
    }

    #[test]
    fn test_operation_budget_halts() {
        let executor = RhaiExecutor::with_limits(SandboxLimits {
            max_operations: 1_000,
            ..SandboxLimits::default()
        });
        let mut msg = decode(ADT);
        let result = executor.execute("loop { }", &mut msg, &context(Stage::Transformer));
        assert!(matches!(result, Err(ScriptError::Halted(_))));

        // A halt only affects its own invocation
        let next = executor.execute("true", &mut msg, &context(Stage::Filter)).unwrap();
        assert!(next.is_true());
    }

    #[test]
    fn test_time_budget_halts() {
        let executor = RhaiExecutor::with_limits(SandboxLimits {
            max_operations: 0,
            timeout_ms: 50,
            ..SandboxLimits::default()
        });
        let mut msg = decode(ADT);
        let result = executor.execute("loop { }", &mut msg, &context(Stage::Transformer));
        assert!(matches!(result, Err(ScriptError::Halted(reason)) if reason.contains("50ms")));
    }

    #[test]
    fn test_halt_inside_function_is_fatal() {
        let executor = RhaiExecutor::with_limits(SandboxLimits {
            max_operations: 1_000,
            ..SandboxLimits::default()
        });
        let mut msg = decode(ADT);
        let result = executor.execute("fn spin() { loop { } } spin()", &mut msg, &context(Stage::Filter));
        assert!(result.unwrap_err().is_fatal());
    }

    #[test]
    fn test_unusable_message_shape() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        let result = executor.execute(r#"msg.HL7Message.PID = 5;"#, &mut msg, &context(Stage::Transformer));
        assert!(matches!(result, Err(ScriptError::Conversion(_))));
        assert_eq!(msg, decode(ADT));
    }

    #[test]
    fn test_logger_and_print() {
        let executor = RhaiExecutor::new();
        let mut msg = decode(ADT);
        let value = executor
            .execute(
                r#"logger.info("hello"); logger.warn(42); print("printed"); true"#,
                &mut msg,
                &context(Stage::Filter),
            )
            .unwrap();
        assert!(value.is_true());
    }

    #[test]
    fn test_validate_and_cache() {
        let executor = RhaiExecutor::new();
        assert!(executor.validate("1 + 2").is_ok());
        assert!(matches!(executor.validate("fn ("), Err(ScriptError::Invalid(_))));

        let mut msg = decode(ADT);
        let ctx = context(Stage::Filter);
        executor.execute("true", &mut msg, &ctx).unwrap();
        executor.execute("true", &mut msg, &ctx).unwrap();
        assert_eq!(executor.cache_len(), 1);
        executor.clear_cache();
        assert_eq!(executor.cache_len(), 0);
    }
}
