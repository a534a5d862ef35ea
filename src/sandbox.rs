use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use thiserror::Error;

/// Function names an untrusted script might reach for that must never exist
/// inside the sandbox. A call to any of these is reported as a policy
/// violation rather than a plain unknown-function error.
const DENIED_CAPABILITIES: &[&str] = &[
    "open",
    "read_file",
    "write_file",
    "append_file",
    "read_dir",
    "remove_file",
    "eval",
    "exec",
    "spawn",
    "system",
    "shell",
    "http_get",
    "http_post",
    "fetch",
    "connect",
    "getenv",
    "env",
    "sleep",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("syntax error: {message}")]
    Syntax { message: String, line: Option<usize> },
    #[error("runtime error: {message}")]
    Runtime { message: String, line: Option<usize> },
    #[error("policy violation: `{capability}` is not available inside the sandbox")]
    PolicyViolation { capability: String },
    #[error("execution exceeded its time or step budget")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub max_operations: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_operations: 5_000_000,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout_ms = std::env::var("SANDBOX_TIMEOUT_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);
        let max_operations = std::env::var("SANDBOX_MAX_OPERATIONS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.max_operations);
        Self {
            timeout: timeout_ms,
            max_operations,
        }
    }
}

/// Runs model-authored scripts with no filesystem, network, environment, or
/// import access. A fresh engine is built per run so nothing leaks between
/// executions.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Compile `code` and call `entry_point` with JSON arguments, returning
    /// the JSON result. Synchronous; use [`Sandbox::run_async`] from async
    /// contexts.
    pub fn run(&self, code: &str, entry_point: &str, args: &[Value]) -> Result<Value, SandboxError> {
        let engine = self.build_engine();

        let ast = engine.compile(code).map_err(|err| SandboxError::Syntax {
            message: err.to_string(),
            line: err.1.line(),
        })?;

        let mut dynamic_args: Vec<Dynamic> = Vec::with_capacity(args.len());
        for arg in args {
            let dynamic = rhai::serde::to_dynamic(arg).map_err(|err| SandboxError::Runtime {
                message: format!("argument conversion failed: {err}"),
                line: None,
            })?;
            dynamic_args.push(dynamic);
        }

        let mut scope = Scope::new();
        let output = engine
            .call_fn::<Dynamic>(&mut scope, &ast, entry_point, dynamic_args)
            .map_err(|err| classify_eval_error(*err))?;

        rhai::serde::from_dynamic(&output).map_err(|err| SandboxError::Runtime {
            message: format!("result conversion failed: {err}"),
            line: None,
        })
    }

    /// [`Sandbox::run`] on the blocking pool, for use from async handlers.
    pub async fn run_async(
        &self,
        code: String,
        entry_point: String,
        args: Vec<Value>,
    ) -> Result<Value, SandboxError> {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || sandbox.run(&code, &entry_point, &args))
            .await
            .map_err(|err| SandboxError::Runtime {
                message: format!("sandbox task failed: {err}"),
                line: None,
            })?
    }

    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.set_max_operations(self.config.max_operations);
        engine.set_max_call_levels(64);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(10_000);

        let deadline = Instant::now() + self.config.timeout;
        engine.on_progress(move |operations| {
            // Checking the clock every operation is wasteful; every 1024 is
            // plenty for a wall-clock budget measured in milliseconds.
            if operations % 1024 == 0 && Instant::now() > deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        engine
    }
}

fn classify_eval_error(err: EvalAltResult) -> SandboxError {
    match err {
        EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
            SandboxError::Timeout
        }
        EvalAltResult::ErrorFunctionNotFound(signature, position) => {
            let name = signature
                .split('(')
                .next()
                .unwrap_or(&signature)
                .trim()
                .to_string();
            if DENIED_CAPABILITIES.contains(&name.as_str()) {
                SandboxError::PolicyViolation { capability: name }
            } else {
                SandboxError::Runtime {
                    message: format!("function not found: {signature}"),
                    line: position.line(),
                }
            }
        }
        EvalAltResult::ErrorModuleNotFound(module, _) => SandboxError::PolicyViolation {
            capability: format!("import \"{module}\""),
        },
        EvalAltResult::ErrorParsing(inner, position) => SandboxError::Syntax {
            message: inner.to_string(),
            line: position.line(),
        },
        other => {
            let line = other.position().line();
            SandboxError::Runtime {
                message: other.to_string(),
                line,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig {
            timeout: Duration::from_millis(250),
            max_operations: 500_000,
        })
    }

    #[test]
    fn calls_entry_point_with_json_args() {
        let code = "fn add(a, b) { a + b }";
        let out = sandbox().run(code, "add", &[json!(2), json!(40)]).unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn maps_and_arrays_round_trip() {
        let code = r#"
            fn describe(product) {
                let issues = [];
                if product.name == () { issues.push("no name"); }
                #{ id: product.id, issues: issues }
            }
        "#;
        let out = sandbox()
            .run(code, "describe", &[json!({ "id": "p1" })])
            .unwrap();
        assert_eq!(out, json!({ "id": "p1", "issues": ["no name"] }));
    }

    #[test]
    fn reports_syntax_errors() {
        let err = sandbox().run("fn broken( {", "broken", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
    }

    #[test]
    fn reports_runtime_errors_with_line() {
        let code = "fn boom() {\n  let xs = [];\n  xs[5]\n}";
        let err = sandbox().run(code, "boom", &[]).unwrap_err();
        match err {
            SandboxError::Runtime { line, .. } => assert_eq!(line, Some(3)),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn file_access_is_a_policy_violation() {
        let code = r#"fn steal() { open("/etc/passwd") }"#;
        let err = sandbox().run(code, "steal", &[]).unwrap_err();
        assert_eq!(
            err,
            SandboxError::PolicyViolation {
                capability: "open".to_string()
            }
        );
    }

    #[test]
    fn imports_are_a_policy_violation() {
        let code = "import \"fs\" as fs;\nfn noop() { 0 }";
        let err = sandbox().run(code, "noop", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::PolicyViolation { .. }));
    }

    #[test]
    fn infinite_loops_hit_the_budget() {
        let code = "fn spin() { loop { } }";
        let err = sandbox().run(code, "spin", &[]).unwrap_err();
        assert_eq!(err, SandboxError::Timeout);
    }

    #[test]
    fn unknown_helper_is_a_plain_runtime_error() {
        let code = "fn run() { frobnicate(1) }";
        let err = sandbox().run(code, "run", &[]).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { .. }));
    }
}
