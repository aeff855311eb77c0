//! Execution coordinator
//!
//! Resolves the project configuration, picks the root component, builds its
//! context and either runs it once or hands it to the watch scheduler. The
//! coordinator only reports an [`Outcome`]; terminating the process is left to
//! the binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde_json::Value;
use thiserror::Error;

use crate::classify::{Classification, classify};
use crate::component::{ComponentConstructor, ComponentError, Invocation};
use crate::config_file::{ConfigError, ServerlessFile, resolve};
use crate::context::{CloseStatus, Context, ContextFactory, RunConfig, TerminalContext};
use crate::inputs::{Inputs, ParsedArgs, flag};
use crate::script::{NodeScriptLoader, ScriptLoader};
use crate::template::TemplateConstructor;
use crate::watch::{ChangeSource, NotifyChangeSource, WatchError, WatchScheduler};

/// Failures inside a run. These are rendered through the run's context.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// No components configuration here; nothing was done
    Skipped,
    /// The invocation succeeded, with its outputs (`Null` after watch mode)
    Done(Value),
    Failed,
}

impl Outcome {
    /// Process exit code for this outcome; `None` when no run took place.
    #[must_use]
    pub fn exit_code(&self) -> Option<u8> {
        match self {
            Outcome::Skipped => None,
            Outcome::Done(_) => Some(0),
            Outcome::Failed => Some(1),
        }
    }
}

pub struct Coordinator {
    cwd: PathBuf,
    scripts: Arc<dyn ScriptLoader>,
    template: Arc<dyn ComponentConstructor>,
    contexts: Arc<dyn ContextFactory>,
    watcher: Arc<dyn ChangeSource>,
}

fn terminal_context(config: RunConfig) -> Arc<dyn Context> {
    Arc::new(TerminalContext::stdout(config))
}

impl Coordinator {
    /// Coordinator for `cwd` with the default Node loader, terminal output and file watcher.
    #[must_use]
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            scripts: Arc::new(NodeScriptLoader::from_env()),
            template: Arc::new(TemplateConstructor),
            contexts: Arc::new(terminal_context),
            watcher: Arc::new(NotifyChangeSource::default()),
        }
    }

    #[must_use]
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptLoader>) -> Self {
        self.scripts = scripts;
        self
    }

    #[must_use]
    pub fn with_template(mut self, template: Arc<dyn ComponentConstructor>) -> Self {
        self.template = template;
        self
    }

    #[must_use]
    pub fn with_contexts(mut self, contexts: Arc<dyn ContextFactory>) -> Self {
        self.contexts = contexts;
        self
    }

    #[must_use]
    pub fn with_watcher(mut self, watcher: Arc<dyn ChangeSource>) -> Self {
        self.watcher = watcher;
        self
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Run the root component for `explicit`, or for whatever `cwd` resolves to.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if resolution itself fails. Failures once the
    /// component exists are rendered and reported as [`Outcome::Failed`].
    pub async fn run(
        &self,
        explicit: Option<ServerlessFile>,
        args: ParsedArgs,
    ) -> Result<Outcome, ConfigError> {
        let file = match explicit {
            Some(file) => Some(file),
            None => resolve(&self.cwd, self.scripts.as_ref())?,
        };
        let Some(file) = file else {
            debug!("No configuration in {}", self.cwd.display());
            return Ok(Outcome::Skipped);
        };

        let ParsedArgs { method, mut inputs } = args;
        let constructor = match (classify(&file), file) {
            (Classification::Template, ServerlessFile::Document(template)) => {
                inputs.insert("template".to_string(), template);
                self.template.clone()
            }
            (Classification::Script, ServerlessFile::Constructor(constructor)) => constructor,
            _ => {
                debug!("{} is not a components project", self.cwd.display());
                return Ok(Outcome::Skipped);
            }
        };

        let debug = flag(&inputs, "debug");
        let watch = flag(&inputs, "watch");
        let config = RunConfig::new(self.cwd.clone(), debug, constructor.name());
        let context = self.contexts.create(config);
        let invocation = Invocation::from(method);
        info!("Running {} ({invocation:?})", constructor.name());

        // `None`: watch mode, which renders outputs after every run itself
        let result = if watch {
            self.watch(constructor.as_ref(), invocation, inputs, context.clone())
                .await
                .map(|()| None)
        } else {
            Self::once(constructor.as_ref(), &invocation, inputs, context.clone())
                .await
                .map(Some)
        };

        Ok(match result {
            Ok(outputs) => {
                if let Some(outputs) = &outputs {
                    context.render_outputs(outputs);
                }
                context.close(CloseStatus::Done, None);
                Outcome::Done(outputs.unwrap_or_default())
            }
            Err(e) => {
                context.render_error(&e);
                context.close(CloseStatus::Error, Some(&e));
                Outcome::Failed
            }
        })
    }

    async fn once(
        constructor: &dyn ComponentConstructor,
        invocation: &Invocation,
        inputs: Inputs,
        context: Arc<dyn Context>,
    ) -> Result<Value, RunError> {
        let mut component = constructor.construct(None, context);
        component.init().await?;
        Ok(invocation.dispatch(component.as_mut(), inputs).await?)
    }

    async fn watch(
        &self,
        constructor: &dyn ComponentConstructor,
        invocation: Invocation,
        inputs: Inputs,
        context: Arc<dyn Context>,
    ) -> Result<(), RunError> {
        let mut component = constructor.construct(None, context.clone());
        component.init().await?;
        // the rest of `stream` holds the watcher and lives until we return
        let stream = self.watcher.watch(&self.cwd)?;
        WatchScheduler::new(component, invocation, inputs, context)
            .run(stream.events)
            .await?;
        Ok(())
    }
}
