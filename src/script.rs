//! Script-defined components
//!
//! `serverless.js` is never evaluated by this crate. A tiny Node.js shim does
//! it instead, in one of two modes:
//!
//! - `describe <file>`: one-shot; reports whether the export is a constructor
//!   or a plain object graph
//! - `serve <file>`: long-lived; reads one JSON request per line on stdin and
//!   answers each with one JSON line on stdout. The first request (`init`)
//!   constructs the component and awaits its `init()`; every later request
//!   (`invoke`) calls a method, or the component itself, on that same instance.
//!
//! The shim routes all console output to stderr so stdout only carries responses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};

use crate::component::{Component, ComponentConstructor, ComponentError};
use crate::config_file::{ConfigError, ServerlessFile};
use crate::context::Context;
use crate::inputs::Inputs;

/// Environment variable overriding the Node.js executable.
pub const NODE_ENV_VAR: &str = "COMPONENTS_NODE";

const DEFAULT_NODE: &str = "node";

/// Entity name used when the export is an anonymous function.
const ANONYMOUS_COMPONENT: &str = "Component";

const NODE_SHIM: &str = r"
const path = require('path');
const readline = require('readline');

const [, mode, file] = process.argv;
const emit = (payload) => process.stdout.write(JSON.stringify(payload) + '\n');

console.log = (...args) => console.error(...args);
console.info = (...args) => console.error(...args);

const load = () => require(path.resolve(file));

const failure = (error) => ({
  ok: false,
  error: {
    message: error && error.message ? error.message : String(error),
    stack: error && error.stack ? error.stack : null,
  },
});

const createContext = (request) => ({
  root: request.root,
  stateRoot: request.stateRoot,
  debugMode: Boolean(request.debug),
  status: (message) => console.error(`status: ${message}`),
  log: (...args) => console.error(...args),
  debug: (...args) => {
    if (request.debug) console.error(...args);
  },
  instance: { renderOutputs: () => {}, renderError: () => {} },
});

const describe = () => {
  const exported = load();
  if (typeof exported === 'function') {
    emit({ kind: 'constructor', name: exported.name || null });
  } else {
    emit({ kind: 'document', value: exported === undefined ? null : exported });
  }
};

let component;

const handle = async (request) => {
  if (request.op === 'init') {
    const Exported = load();
    const id = request.id === null ? undefined : request.id;
    component = new Exported(id, createContext(request));
    if (typeof component.init === 'function') {
      await component.init();
    }
    return { ok: true, outputs: null };
  }

  if (component === undefined) {
    throw new Error('component was not initialised');
  }
  const inputs = request.inputs || {};
  let outputs;
  if (request.method) {
    if (typeof component[request.method] !== 'function') {
      return { ok: false, missingMethod: request.method };
    }
    outputs = await component[request.method](inputs);
  } else if (typeof component === 'function') {
    outputs = await component(inputs);
  } else if (typeof component.default === 'function') {
    outputs = await component.default(inputs);
  } else {
    throw new Error('component has no default behaviour');
  }
  return { ok: true, outputs: outputs === undefined ? null : outputs };
};

const serve = () => {
  const lines = readline.createInterface({ input: process.stdin, terminal: false });
  let queue = Promise.resolve();
  lines.on('line', (line) => {
    if (!line.trim()) return;
    queue = queue
      .then(() => handle(JSON.parse(line)))
      .then(emit, (error) => emit(failure(error)));
  });
};

try {
  if (mode === 'describe') {
    describe();
  } else {
    serve();
  }
} catch (error) {
  emit(failure(error));
  process.exitCode = 1;
}
";

/// Loads `serverless.js` exports.
pub trait ScriptLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns `ConfigError::Script` if the script cannot be evaluated.
    fn load(&self, path: &Path) -> Result<ServerlessFile, ConfigError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Description {
    Constructor {
        #[serde(default)]
        name: Option<String>,
    },
    Document {
        #[serde(default)]
        value: Value,
    },
}

#[derive(Debug, Deserialize)]
struct ShimError {
    message: String,
    #[serde(default)]
    stack: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShimResponse {
    Description(Description),
    Result {
        ok: bool,
        #[serde(default)]
        outputs: Value,
        #[serde(default)]
        error: Option<ShimError>,
        #[serde(default, rename = "missingMethod")]
        missing_method: Option<String>,
    },
}

/// Parse the last non-empty stdout line of the shim.
fn parse_response(stdout: &str) -> Result<ShimResponse, serde_json::Error> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();
    serde_json::from_str(line)
}

fn entity_name(path: &Path, name: Option<String>) -> String {
    match name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => {
            debug!(
                "{} exports an anonymous constructor, using `{ANONYMOUS_COMPONENT}`",
                path.display()
            );
            ANONYMOUS_COMPONENT.to_string()
        }
    }
}

/// [`ScriptLoader`] backed by a Node.js executable.
#[derive(Debug, Clone)]
pub struct NodeScriptLoader {
    node: String,
}

impl NodeScriptLoader {
    #[must_use]
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }

    /// Use `$COMPONENTS_NODE`, falling back to `node` on the `PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var(NODE_ENV_VAR).unwrap_or_else(|_| DEFAULT_NODE.to_string()))
    }
}

impl Default for NodeScriptLoader {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ScriptLoader for NodeScriptLoader {
    fn load(&self, path: &Path) -> Result<ServerlessFile, ConfigError> {
        let script_error = |message: String| ConfigError::Script {
            path: path.to_path_buf(),
            message,
        };

        debug!("Describing {} with {}", path.display(), self.node);
        let output = std::process::Command::new(&self.node)
            .arg("-e")
            .arg(NODE_SHIM)
            .arg("describe")
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| script_error(format!("failed to run `{}`: {e}", self.node)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_response(&stdout).map_err(|e| script_error(e.to_string()))? {
            ShimResponse::Description(Description::Constructor { name }) => {
                let name = entity_name(path, name);
                debug!("{} exports constructor {name}", path.display());
                Ok(ServerlessFile::Constructor(Arc::new(ScriptConstructor {
                    node: self.node.clone(),
                    path: path.to_path_buf(),
                    name,
                })))
            }
            ShimResponse::Description(Description::Document { value }) => {
                Ok(ServerlessFile::Document(value))
            }
            ShimResponse::Result { error, .. } => Err(script_error(error.map_or_else(
                || format!("shim exited with {}", output.status),
                |e| e.message,
            ))),
        }
    }
}

/// Constructor exported by a `serverless.js` file.
#[derive(Debug, Clone)]
pub struct ScriptConstructor {
    node: String,
    path: PathBuf,
    name: String,
}

impl ComponentConstructor for ScriptConstructor {
    fn name(&self) -> &str {
        &self.name
    }

    fn construct(&self, id: Option<String>, context: Arc<dyn Context>) -> Box<dyn Component> {
        Box::new(ScriptComponent {
            constructor: self.clone(),
            id,
            context,
            process: None,
        })
    }
}

/// A running `serve` shim holding the one component instance.
struct ShimProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ShimProcess {
    fn spawn(constructor: &ScriptConstructor, cwd: &Path) -> Result<Self, ComponentError> {
        debug!(
            "Starting {} for {}",
            constructor.node,
            constructor.path.display()
        );
        let mut child = TokioCommand::new(&constructor.node)
            .arg("-e")
            .arg(NODE_SHIM)
            .arg("serve")
            .arg(&constructor.path)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("shim stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("shim stdout is not piped"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn request(&mut self, request: &Value) -> Result<ShimResponse, ComponentError> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;

        while let Some(line) = self.stdout.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_response(&line) {
                Ok(response) => return Ok(response),
                // the script wrote to stdout directly
                Err(e) => warn!("Ignoring unexpected component output ({e}): {line}"),
            }
        }

        let status = self.child.wait().await?;
        Err(std::io::Error::other(format!("component runtime exited with {status}")).into())
    }
}

pub struct ScriptComponent {
    constructor: ScriptConstructor,
    id: Option<String>,
    context: Arc<dyn Context>,
    process: Option<ShimProcess>,
}

impl ScriptComponent {
    fn failed(&self, message: String) -> ComponentError {
        ComponentError::Failed {
            component: self.constructor.name.clone(),
            message,
        }
    }

    async fn send(&mut self, request: Value) -> Result<Value, ComponentError> {
        let Some(process) = self.process.as_mut() else {
            return Err(self.failed("component was not initialised".to_string()));
        };
        match process.request(&request).await? {
            ShimResponse::Result {
                missing_method: Some(method),
                ..
            } => Err(ComponentError::MethodNotFound(method)),
            ShimResponse::Result {
                ok: true, outputs, ..
            } => Ok(outputs),
            ShimResponse::Result { error, .. } => {
                if let Some(stack) = error.as_ref().and_then(|e| e.stack.as_deref()) {
                    debug!("{stack}");
                }
                Err(self.failed(error.map_or_else(
                    || "component runtime reported a failure".to_string(),
                    |e| e.message,
                )))
            }
            ShimResponse::Description(_) => Err(self.failed("unexpected response".to_string())),
        }
    }

    fn invoke_request(method: Option<&str>, inputs: Inputs) -> Value {
        json!({ "op": "invoke", "method": method, "inputs": inputs })
    }
}

#[async_trait]
impl Component for ScriptComponent {
    async fn init(&mut self) -> Result<(), ComponentError> {
        let config = self.context.config();
        let request = json!({
            "op": "init",
            "id": self.id,
            "root": config.root.to_string_lossy(),
            "stateRoot": config.state_root.to_string_lossy(),
            "debug": config.debug,
        });
        if self.process.is_none() {
            self.process = Some(ShimProcess::spawn(&self.constructor, &config.root)?);
        }
        self.send(request).await.map(|_| ())
    }

    async fn invoke(&mut self, inputs: Inputs) -> Result<Value, ComponentError> {
        self.send(Self::invoke_request(None, inputs)).await
    }

    async fn call_method(&mut self, name: &str, inputs: Inputs) -> Result<Value, ComponentError> {
        self.send(Self::invoke_request(Some(name), inputs)).await
    }
}
