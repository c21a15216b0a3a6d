//! Callable resolution: binding node `call` targets to user code.
//!
//! The engine sees one narrow interface: `call(inputs, config) -> outputs`.
//! Two bindings are provided. The in-process registry holds Rust closures
//! (tests and embedders). The subprocess binding spawns one process per call
//! and speaks JSON over stdio, which isolates user-code crashes without
//! changing the engine.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::value::{Value, map_from_json_object, map_to_json_object};

/// Error raised by user code or its binding.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: String,
    pub message: String,
    /// Stringified trace when the binding can produce one.
    pub trace: Option<String>,
}

impl CallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }
}

pub type CallResult = Result<BTreeMap<String, Value>, CallError>;

/// One user-provided function behind a node.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(
        &self,
        inputs: BTreeMap<String, Value>,
        config: BTreeMap<String, Value>,
    ) -> CallResult;
}

/// Maps a node's `call` target to a callable. Injected into the engine by
/// the orchestrator (or the CLI) when a run starts.
pub trait CallableResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>>;
}

// ----------------------------------------------------------------------------
// In-process binding
// ----------------------------------------------------------------------------

type BoxedFn =
    dyn Fn(BTreeMap<String, Value>, BTreeMap<String, Value>) -> CallResult + Send + Sync;

struct FnCallable {
    func: Box<BoxedFn>,
}

#[async_trait]
impl Callable for FnCallable {
    async fn call(
        &self,
        inputs: BTreeMap<String, Value>,
        config: BTreeMap<String, Value>,
    ) -> CallResult {
        (self.func)(inputs, config)
    }
}

/// Registry of in-process callables keyed by function name.
#[derive(Default, Clone)]
pub struct InProcessRegistry {
    functions: HashMap<String, Arc<dyn Callable>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callable: Arc<dyn Callable>) {
        self.functions.insert(name.into(), callable);
    }

    /// Register a plain closure as a callable.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(BTreeMap<String, Value>, BTreeMap<String, Value>) -> CallResult
            + Send
            + Sync
            + 'static,
    {
        self.register(
            name,
            Arc::new(FnCallable {
                func: Box::new(func),
            }),
        );
    }
}

impl CallableResolver for InProcessRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.functions.get(name).cloned()
    }
}

// ----------------------------------------------------------------------------
// Subprocess binding
// ----------------------------------------------------------------------------

#[derive(Serialize)]
struct CallRequest<'a> {
    call: &'a str,
    inputs: JsonValue,
    config: JsonValue,
}

#[derive(Deserialize)]
struct CallResponse {
    #[serde(default)]
    outputs: Option<JsonValue>,
    #[serde(default)]
    error: Option<CallResponseError>,
}

#[derive(Deserialize)]
struct CallResponseError {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    trace: Option<String>,
}

/// Resolves every name against one executable module. Each call spawns the
/// module with `{"call", "inputs", "config"}` on stdin and expects
/// `{"outputs"}` or `{"error"}` on stdout.
pub struct SubprocessResolver {
    program: PathBuf,
}

impl SubprocessResolver {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl CallableResolver for SubprocessResolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>> {
        Some(Arc::new(SubprocessCallable {
            program: self.program.clone(),
            name: name.to_string(),
        }))
    }
}

struct SubprocessCallable {
    program: PathBuf,
    name: String,
}

#[async_trait]
impl Callable for SubprocessCallable {
    async fn call(
        &self,
        inputs: BTreeMap<String, Value>,
        config: BTreeMap<String, Value>,
    ) -> CallResult {
        let request = CallRequest {
            call: &self.name,
            inputs: map_to_json_object(&inputs),
            config: map_to_json_object(&config),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|err| CallError::new("SubprocessFailed", err.to_string()))?;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                CallError::new(
                    "SubprocessFailed",
                    format!("failed to spawn {}: {}", self.program.display(), err),
                )
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(&payload).await.map_err(|err| {
                CallError::new("SubprocessFailed", format!("failed to write request: {}", err))
            })?;
        }
        drop(child.stdin.take());

        let output = child.wait_with_output().await.map_err(|err| {
            CallError::new("SubprocessFailed", format!("failed to wait for call: {}", err))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CallError {
                kind: "SubprocessFailed".to_string(),
                message: format!("call '{}' exited with {}", self.name, output.status),
                trace: (!stderr.is_empty()).then(|| stderr.into_owned()),
            });
        }

        let response: CallResponse = serde_json::from_slice(&output.stdout).map_err(|err| {
            CallError::new(
                "SubprocessFailed",
                format!("invalid response from call '{}': {}", self.name, err),
            )
        })?;

        if let Some(error) = response.error {
            return Err(CallError {
                kind: error.kind.unwrap_or_else(|| "CallFailed".to_string()),
                message: error.message.unwrap_or_default(),
                trace: error.trace,
            });
        }

        let outputs = response.outputs.unwrap_or(JsonValue::Object(Default::default()));
        map_from_json_object(&outputs).ok_or_else(|| {
            CallError::new(
                "SubprocessFailed",
                format!("call '{}' returned a non-object outputs payload", self.name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_registry() {
        let mut registry = InProcessRegistry::new();
        registry.register_fn("add_one", |inputs, _config| {
            let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(BTreeMap::from([("out".to_string(), Value::Int(x + 1))]))
        });

        let callable = registry.resolve("add_one").unwrap();
        let result = callable
            .call(
                BTreeMap::from([("x".to_string(), Value::Int(3))]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.get("out"), Some(&Value::Int(4)));

        assert!(registry.resolve("missing").is_none());
    }

    #[tokio::test]
    async fn test_in_process_error_propagates() {
        let mut registry = InProcessRegistry::new();
        registry.register_fn("boom", |_inputs, _config| {
            Err(CallError::new("ValueError", "bad input"))
        });

        let err = registry
            .resolve("boom")
            .unwrap()
            .call(BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, "ValueError");
    }

    #[tokio::test]
    async fn test_subprocess_round_trip() {
        // `jq` style echo via the shell: read stdin, emit an outputs object.
        let script = r#"
import json, sys
req = json.load(sys.stdin)
if req["call"] == "fail":
    print(json.dumps({"error": {"kind": "Boom", "message": "nope"}}))
else:
    print(json.dumps({"outputs": {"echo": req["inputs"], "thread": req["config"].get("configurable", {}).get("thread_id")}}))
"#;
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("module.py");
        std::fs::write(&module, script).unwrap();
        let wrapper = dir.path().join("module");
        std::fs::write(
            &wrapper,
            format!("#!/bin/sh\nexec python3 {} \"$@\"\n", module.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let resolver = SubprocessResolver::new(wrapper);
        let callable = resolver.resolve("echo").unwrap();
        let result = callable
            .call(
                BTreeMap::from([("x".to_string(), Value::Int(1))]),
                BTreeMap::new(),
            )
            .await
            .unwrap();
        let echoed = result.get("echo").and_then(Value::as_map).unwrap();
        assert_eq!(echoed.get("x"), Some(&Value::Int(1)));

        let err = resolver
            .resolve("fail")
            .unwrap()
            .call(BTreeMap::new(), BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, "Boom");
    }
}
