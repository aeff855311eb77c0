//! Component runtime seam
//!
//! Every root component, whether the built-in template or a script export,
//! exposes the same capability set: a lifecycle initializer, a default
//! invocation and optional named methods. The coordinator only ever talks to
//! components through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;
use crate::inputs::Inputs;

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("method {0} not found")]
    MethodNotFound(String),
    #[error("{component}: {message}")]
    Failed { component: String, message: String },
    #[error("Component runtime error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid component response: {0}")]
    Response(#[from] serde_json::Error),
}

/// What to call on the root component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Call the component itself
    Default,
    Method(String),
}

impl From<Option<String>> for Invocation {
    fn from(method: Option<String>) -> Self {
        method.map_or(Invocation::Default, Invocation::Method)
    }
}

impl Invocation {
    /// Run this invocation against `component`.
    ///
    /// # Errors
    ///
    /// Returns `ComponentError::MethodNotFound` if a named method is not exposed
    /// by the component, or whatever error the component itself reports.
    pub async fn dispatch(
        &self,
        component: &mut dyn Component,
        inputs: Inputs,
    ) -> Result<Value, ComponentError> {
        match self {
            Invocation::Default => component.invoke(inputs).await,
            Invocation::Method(name) => component.call_method(name, inputs).await,
        }
    }
}

#[async_trait]
pub trait Component: Send {
    /// Lifecycle initializer, awaited once before any invocation.
    async fn init(&mut self) -> Result<(), ComponentError>;

    /// Default behaviour, used when no method name was given.
    async fn invoke(&mut self, inputs: Inputs) -> Result<Value, ComponentError>;

    /// Call the named method on the live instance.
    ///
    /// Implementations return `ComponentError::MethodNotFound` when the
    /// instance exposes no such method at call time.
    async fn call_method(&mut self, name: &str, inputs: Inputs) -> Result<Value, ComponentError>;
}

/// Creates root components. Script exports and the built-in template both provide one.
pub trait ComponentConstructor: Send + Sync {
    /// Identifier used as the run's entity name.
    fn name(&self) -> &str;

    fn construct(&self, id: Option<String>, context: Arc<dyn Context>) -> Box<dyn Component>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        calls: Vec<String>,
    }

    #[async_trait]
    impl Component for Echo {
        async fn init(&mut self) -> Result<(), ComponentError> {
            Ok(())
        }

        async fn invoke(&mut self, inputs: Inputs) -> Result<Value, ComponentError> {
            self.calls.push("default".to_string());
            Ok(Value::Object(inputs))
        }

        async fn call_method(
            &mut self,
            name: &str,
            _inputs: Inputs,
        ) -> Result<Value, ComponentError> {
            if name != "deploy" {
                return Err(ComponentError::MethodNotFound(name.to_string()));
            }
            self.calls.push(name.to_string());
            Ok(json!({ "method": name }))
        }
    }

    fn inputs() -> Inputs {
        let mut inputs = Inputs::new();
        inputs.insert("stage".to_string(), json!("prod"));
        inputs
    }

    #[tokio::test]
    async fn test_default_invocation() {
        let mut echo = Echo { calls: Vec::new() };
        let out = Invocation::from(None::<String>)
            .dispatch(&mut echo, inputs())
            .await
            .unwrap();
        assert_eq!(out, json!({ "stage": "prod" }));
        assert_eq!(echo.calls, vec!["default"]);
    }

    #[tokio::test]
    async fn test_named_method() {
        let mut echo = Echo { calls: Vec::new() };
        let invocation = Invocation::from(Some("deploy".to_string()));
        let out = invocation.dispatch(&mut echo, inputs()).await.unwrap();
        assert_eq!(out, json!({ "method": "deploy" }));
        assert_eq!(echo.calls, vec!["deploy"]);
    }

    #[tokio::test]
    async fn test_missing_method_is_typed_error() {
        let mut echo = Echo { calls: Vec::new() };
        let invocation = Invocation::Method("remove".to_string());
        match invocation.dispatch(&mut echo, inputs()).await {
            Err(ComponentError::MethodNotFound(name)) => assert_eq!(name, "remove"),
            other => panic!("Expected MethodNotFound, got: {other:?}"),
        }
        assert!(echo.calls.is_empty());
    }
}
