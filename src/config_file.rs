//! Configuration file resolution
//!
//! A project directory is checked for `serverless.js` first, then for the
//! markup candidates `serverless.yml`, `serverless.yaml` and `serverless.json`.
//! Only the first existing candidate is ever read.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;
use thiserror::Error;

use crate::component::ComponentConstructor;
use crate::script::ScriptLoader;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(String),
    #[error("Unable to read config file {path}: {source}")]
    Read {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("Unable to parse YAML config file {path}: {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("Unable to parse JSON config file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("Unable to load script {path}: {message}")]
    Script { path: PathBuf, message: String },
}

/// Coarse classification of a configuration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The markup itself could not be understood (syntax, unsupported tags)
    MarkupGrammar,
    Other,
}

impl ConfigError {
    #[must_use]
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ConfigError::Yaml { .. } => ParseErrorKind::MarkupGrammar,
            _ => ParseErrorKind::Other,
        }
    }
}

/// A loaded configuration: either a component constructor exported by a
/// script, or a plain object graph (markup, or a script exporting data).
#[derive(Clone)]
pub enum ServerlessFile {
    Constructor(Arc<dyn ComponentConstructor>),
    Document(Value),
}

impl fmt::Debug for ServerlessFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerlessFile::Constructor(c) => f.debug_tuple("Constructor").field(&c.name()).finish(),
            ServerlessFile::Document(v) => f.debug_tuple("Document").field(v).finish(),
        }
    }
}

pub const SCRIPT_FILENAME: &str = "serverless.js";

/// Markup candidates whose grammar errors are tolerated, in precedence order
const YAML_FILENAMES: [&str; 2] = ["serverless.yml", "serverless.yaml"];

pub const JSON_FILENAME: &str = "serverless.json";

/// Resolve the configuration for `dir`.
///
/// Returns `Ok(None)` when no candidate exists, or when the chosen YAML
/// candidate has a grammar error (some valid framework files use tags this
/// parser does not understand).
///
/// # Errors
///
/// Returns `ConfigError` if the script cannot be loaded, a candidate cannot be
/// read, or `serverless.json` is malformed. `serverless.json` is never
/// consulted once a YAML candidate exists.
pub fn resolve(dir: &Path, scripts: &dyn ScriptLoader) -> Result<Option<ServerlessFile>, ConfigError> {
    debug!("Resolving configuration in {}", dir.display());

    let script_path = dir.join(SCRIPT_FILENAME);
    if script_path.exists() {
        info!("Found config file: {}", script_path.display());
        return scripts.load(&script_path).map(Some);
    }

    if let Some(yaml_path) = YAML_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
    {
        info!("Found config file: {}", yaml_path.display());
        return match read_markup(&yaml_path) {
            Ok(value) => Ok(Some(ServerlessFile::Document(value))),
            Err(e) if e.kind() == ParseErrorKind::MarkupGrammar => {
                debug!("Ignoring {}: {e}", yaml_path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        };
    }

    let json_path = dir.join(JSON_FILENAME);
    if json_path.exists() {
        info!("Found config file: {}", json_path.display());
        return read_markup(&json_path).map(|value| Some(ServerlessFile::Document(value)));
    }

    debug!("No configuration found in {}", dir.display());
    Ok(None)
}

/// Read and parse a markup file; `.json` files are parsed as JSON, anything else as YAML.
///
/// # Errors
///
/// Returns `ConfigError::Read` if the file cannot be read, or
/// `ConfigError::Yaml`/`ConfigError::Json` if parsing fails.
pub fn read_markup(file: &Path) -> Result<Value, ConfigError> {
    let contents = std::fs::read_to_string(file).map_err(|e| ConfigError::Read {
        source: e,
        path: file.to_path_buf(),
    })?;
    if file.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
            source: e,
            path: file.to_path_buf(),
        })
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Yaml {
            source: e,
            path: file.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Hands back a fixed document for any script path.
    struct StubScripts(Value);

    impl ScriptLoader for StubScripts {
        fn load(&self, _path: &Path) -> Result<ServerlessFile, ConfigError> {
            Ok(ServerlessFile::Document(self.0.clone()))
        }
    }

    fn stub() -> StubScripts {
        StubScripts(json!({ "from": "script" }))
    }

    fn document(file: Option<ServerlessFile>) -> Value {
        match file {
            Some(ServerlessFile::Document(v)) => v,
            other => panic!("Expected a document, got: {other:?}"),
        }
    }

    #[test]
    fn test_script_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.js"), "module.exports = {}").unwrap();
        std::fs::write(dir.path().join("serverless.yml"), "from: yml\n").unwrap();
        let resolved = resolve(dir.path(), &stub()).unwrap();
        assert_eq!(document(resolved), json!({ "from": "script" }));
    }

    #[test]
    fn test_yml_wins_over_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.yml"), "from: yml\n").unwrap();
        std::fs::write(dir.path().join("serverless.json"), r#"{"from": "json"}"#).unwrap();
        let resolved = resolve(dir.path(), &stub()).unwrap();
        assert_eq!(document(resolved), json!({ "from": "yml" }));
    }

    #[test]
    fn test_yaml_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.yaml"), "app:\n  component: express\n").unwrap();
        let resolved = resolve(dir.path(), &stub()).unwrap();
        assert_eq!(document(resolved), json!({ "app": { "component": "express" } }));
    }

    #[test]
    fn test_yml_wins_over_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.yml"), "from: yml\n").unwrap();
        std::fs::write(dir.path().join("serverless.yaml"), "from: yaml\n").unwrap();
        let resolved = resolve(dir.path(), &stub()).unwrap();
        assert_eq!(document(resolved), json!({ "from": "yml" }));
    }

    #[test]
    fn test_yaml_extension_grammar_error_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.yaml"), "app: [unclosed\n  - x: :\n").unwrap();
        std::fs::write(dir.path().join("serverless.json"), r#"{"from": "json"}"#).unwrap();
        assert!(resolve(dir.path(), &stub()).unwrap().is_none());
    }

    #[test]
    fn test_json_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.json"), r#"{"from": "json"}"#).unwrap();
        let resolved = resolve(dir.path(), &stub()).unwrap();
        assert_eq!(document(resolved), json!({ "from": "json" }));
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve(dir.path(), &stub()).unwrap().is_none());
    }

    #[test]
    fn test_yaml_grammar_error_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.yml"), "app: [unclosed\n  - x: :\n").unwrap();
        std::fs::write(dir.path().join("serverless.json"), r#"{"from": "json"}"#).unwrap();
        assert!(resolve(dir.path(), &stub()).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_yaml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // a directory named like the candidate exists but cannot be read as a file
        std::fs::create_dir(dir.path().join("serverless.yml")).unwrap();
        std::fs::write(dir.path().join("serverless.json"), r#"{"from": "json"}"#).unwrap();
        match resolve(dir.path(), &stub()) {
            Err(e @ ConfigError::Read { .. }) => assert_eq!(e.kind(), ParseErrorKind::Other),
            other => panic!("Expected ConfigError::Read, got: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("serverless.json"), "{ not json").unwrap();
        match resolve(dir.path(), &stub()) {
            Err(ConfigError::Json { path, .. }) => {
                assert!(path.ends_with("serverless.json"));
            }
            other => panic!("Expected ConfigError::Json, got: {other:?}"),
        }
    }

    #[test]
    fn test_error_kinds() {
        let yaml = serde_yaml::from_str::<Value>("a: [").unwrap_err();
        let err = ConfigError::Yaml {
            source: yaml,
            path: PathBuf::from("serverless.yml"),
        };
        assert_eq!(err.kind(), ParseErrorKind::MarkupGrammar);
        let err = ConfigError::Script {
            path: PathBuf::from("serverless.js"),
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), ParseErrorKind::Other);
    }
}
