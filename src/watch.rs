//! Watch mode
//!
//! File changes under the project root re-run the root component. At most one
//! invocation is in flight; changes that arrive meanwhile collapse into a single
//! follow-up run. Changes arriving during that follow-up run are dropped.

use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::component::{Component, ComponentError, Invocation};
use crate::context::Context;
use crate::inputs::Inputs;

/// Paths matching this are never reported as changes (component state lives there).
pub const DEFAULT_IGNORE: &str = r"\.serverless";

static DEFAULT_IGNORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_IGNORE).expect("valid ignore pattern"));

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Error starting file watcher: {0}")]
    Watch(#[from] notify::Error),
    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Message delivered to the scheduler's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watcher is installed
    Ready,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Processing,
    ProcessingWithQueued,
}

/// What a change notification does to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Queue,
    Drop,
}

/// Single-flight bookkeeping for watch mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchState {
    processing: bool,
    queued: bool,
}

impl WatchState {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match (self.processing, self.queued) {
            (false, _) => Phase::Idle,
            (true, false) => Phase::Processing,
            (true, true) => Phase::ProcessingWithQueued,
        }
    }

    pub fn on_change(&mut self) -> Transition {
        match self.phase() {
            Phase::Idle => {
                self.processing = true;
                Transition::Start
            }
            Phase::Processing => {
                self.queued = true;
                Transition::Queue
            }
            Phase::ProcessingWithQueued => Transition::Drop,
        }
    }

    /// Whether a follow-up run was requested while the first one was in flight.
    #[must_use]
    pub fn follow_up_pending(&self) -> bool {
        self.processing && self.queued
    }

    pub fn finish(&mut self) {
        *self = Self::default();
    }
}

/// Runs the root component in response to [`WatchEvent`]s.
pub struct WatchScheduler {
    component: Box<dyn Component>,
    invocation: Invocation,
    inputs: Inputs,
    context: Arc<dyn Context>,
    state: WatchState,
    last_outputs: Option<Value>,
}

impl WatchScheduler {
    /// `inputs` are captured once and reused for every run.
    #[must_use]
    pub fn new(
        component: Box<dyn Component>,
        invocation: Invocation,
        inputs: Inputs,
        context: Arc<dyn Context>,
    ) -> Self {
        Self {
            component,
            invocation,
            inputs,
            context,
            state: WatchState::default(),
            last_outputs: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Process events until the sender side closes.
    ///
    /// # Errors
    ///
    /// Returns the first invocation error; monitoring stops there.
    pub async fn run(mut self, mut events: mpsc::Receiver<WatchEvent>) -> Result<(), ComponentError> {
        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::Ready => self.context.status("Watching"),
                WatchEvent::Change => {
                    if self.state.on_change() == Transition::Start {
                        self.process(&mut events).await?;
                    }
                }
            }
        }
        debug!("Change source closed, leaving watch mode");
        Ok(())
    }

    async fn process(&mut self, events: &mut mpsc::Receiver<WatchEvent>) -> Result<(), ComponentError> {
        let outputs = self.invoke(events).await?;
        self.last_outputs = Some(outputs);

        if self.state.follow_up_pending() {
            debug!("Running queued change");
            let outputs = self.invoke(events).await?;
            self.last_outputs = Some(outputs);
        }

        self.state.finish();
        if let Some(outputs) = &self.last_outputs {
            self.context.render_outputs(outputs);
        }
        self.context.status("Watching");
        Ok(())
    }

    /// One invocation, feeding events that arrive meanwhile into the state machine.
    async fn invoke(&mut self, events: &mut mpsc::Receiver<WatchEvent>) -> Result<Value, ComponentError> {
        let run = self
            .invocation
            .dispatch(self.component.as_mut(), self.inputs.clone());
        tokio::pin!(run);

        let mut open = true;
        loop {
            tokio::select! {
                biased;
                event = events.recv(), if open => match event {
                    Some(WatchEvent::Change) => {
                        let transition = self.state.on_change();
                        debug!("Change while processing: {transition:?}");
                    }
                    Some(WatchEvent::Ready) => {}
                    None => open = false,
                },
                result = &mut run => return result,
            }
        }
    }
}

/// Keeps the underlying watcher alive for as long as events are consumed.
pub struct ChangeStream {
    pub events: mpsc::Receiver<WatchEvent>,
    _watcher: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
}

impl ChangeStream {
    /// A stream fed by something other than a file watcher.
    #[must_use]
    pub fn from_receiver(events: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            events,
            _watcher: None,
        }
    }
}

pub trait ChangeSource: Send + Sync {
    /// Start watching `root`.
    ///
    /// # Errors
    ///
    /// Returns `WatchError` if the watch cannot be installed.
    fn watch(&self, root: &Path) -> Result<ChangeStream, WatchError>;
}

/// File watcher backed by `notify`.
#[derive(Debug, Clone)]
pub struct NotifyChangeSource {
    ignore: Regex,
    debounce: Duration,
}

impl Default for NotifyChangeSource {
    fn default() -> Self {
        Self {
            ignore: DEFAULT_IGNORE_RE.clone(),
            debounce: Duration::from_millis(500),
        }
    }
}

impl NotifyChangeSource {
    /// # Errors
    ///
    /// Returns `WatchError::Pattern` if `pattern` is not a valid regex.
    pub fn with_ignore_pattern(pattern: &str) -> Result<Self, WatchError> {
        Ok(Self {
            ignore: Regex::new(pattern)?,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.is_match(&path.to_string_lossy())
    }
}

/// Only modifications of existing files count; creating or removing files does not.
fn is_change(kind: &EventKind) -> bool {
    kind.is_modify()
}

fn forward(sender: &mpsc::Sender<WatchEvent>, event: WatchEvent) {
    match sender.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("Dropping {event:?}, scheduler is busy"),
        Err(TrySendError::Closed(_)) => debug!("Dropping {event:?}, scheduler has stopped"),
    }
}

impl ChangeSource for NotifyChangeSource {
    fn watch(&self, root: &Path) -> Result<ChangeStream, WatchError> {
        info!("Starting file watcher");
        let (tx, rx) = mpsc::channel(16);
        let source = self.clone();
        let sender = tx.clone();

        let mut debouncer = new_debouncer(self.debounce, None, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    let changed = events
                        .iter()
                        .filter(|event| is_change(&event.event.kind))
                        .flat_map(|event| event.paths.iter())
                        .any(|path| !source.is_ignored(path));
                    if changed {
                        forward(&sender, WatchEvent::Change);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        error!("Watch error: {e:?}");
                    }
                }
            }
        })?;

        info!("Watching path: {}", root.display());
        debouncer
            .watch(root, RecursiveMode::Recursive)
            .inspect_err(|e| warn!("Failed to watch path {}: {e}", root.display()))?;

        forward(&tx, WatchEvent::Ready);
        Ok(ChangeStream {
            events: rx,
            _watcher: Some(debouncer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CloseStatus, RunConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::error::Error;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl Component for Counter {
        async fn init(&mut self) -> Result<(), ComponentError> {
            Ok(())
        }

        async fn invoke(&mut self, inputs: Inputs) -> Result<Value, ComponentError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(run) {
                return Err(ComponentError::Failed {
                    component: "Counter".to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(json!({ "run": run, "stage": inputs.get("stage") }))
        }

        async fn call_method(&mut self, name: &str, _inputs: Inputs) -> Result<Value, ComponentError> {
            Err(ComponentError::MethodNotFound(name.to_string()))
        }
    }

    /// Records what the scheduler renders and signals every rendered output.
    struct Recorder {
        config: RunConfig,
        lines: Mutex<Vec<String>>,
        rendered: mpsc::UnboundedSender<Value>,
    }

    impl Context for Recorder {
        fn config(&self) -> &RunConfig {
            &self.config
        }

        fn status(&self, message: &str) {
            self.lines.lock().push(format!("status {message}"));
        }

        fn render_outputs(&self, outputs: &Value) {
            self.lines.lock().push(format!("outputs {outputs}"));
            let _ = self.rendered.send(outputs.clone());
        }

        fn render_error(&self, error: &dyn Error) {
            self.lines.lock().push(format!("error {error}"));
        }

        fn close(&self, status: CloseStatus, _error: Option<&dyn Error>) {
            self.lines.lock().push(format!("close {}", status.as_str()));
        }
    }

    fn scheduler(
        fail_on: Option<usize>,
    ) -> (
        WatchScheduler,
        Arc<AtomicUsize>,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let runs = Arc::new(AtomicUsize::new(0));
        let (rendered_tx, rendered_rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            config: RunConfig::new(PathBuf::from("/project"), false, "Counter"),
            lines: Mutex::new(Vec::new()),
            rendered: rendered_tx,
        });
        let mut inputs = Inputs::new();
        inputs.insert("stage".to_string(), json!("dev"));
        let scheduler = WatchScheduler::new(
            Box::new(Counter {
                runs: runs.clone(),
                fail_on,
            }),
            Invocation::Default,
            inputs,
            recorder.clone(),
        );
        (scheduler, runs, recorder, rendered_rx)
    }

    #[test]
    fn test_state_transitions() {
        let mut state = WatchState::default();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.on_change(), Transition::Start);
        assert_eq!(state.phase(), Phase::Processing);
        assert!(!state.follow_up_pending());
        assert_eq!(state.on_change(), Transition::Queue);
        assert_eq!(state.phase(), Phase::ProcessingWithQueued);
        assert_eq!(state.on_change(), Transition::Drop);
        assert!(state.follow_up_pending());
        state.finish();
        assert_eq!(state.phase(), Phase::Idle);
        assert_eq!(state.on_change(), Transition::Start);
    }

    #[tokio::test]
    async fn test_ready_reports_watching() {
        let (scheduler, runs, recorder, _rendered) = scheduler(None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(WatchEvent::Ready).await.unwrap();
        drop(tx);
        scheduler.run(rx).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(*recorder.lines.lock(), vec!["status Watching"]);
    }

    #[tokio::test]
    async fn test_burst_runs_exactly_twice() {
        let (scheduler, runs, recorder, _rendered) = scheduler(None);
        let (tx, rx) = mpsc::channel(16);
        for _ in 0..6 {
            tx.send(WatchEvent::Change).await.unwrap();
        }
        drop(tx);
        scheduler.run(rx).await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(
            *recorder.lines.lock(),
            vec![
                r#"outputs {"run":2,"stage":"dev"}"#.to_string(),
                "status Watching".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_change_after_idle_runs_again() {
        let (scheduler, runs, _recorder, mut rendered) = scheduler(None);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(scheduler.run(rx));

        tx.send(WatchEvent::Change).await.unwrap();
        assert_eq!(rendered.recv().await.unwrap()["run"], json!(1));
        tx.send(WatchEvent::Change).await.unwrap();
        assert_eq!(rendered.recv().await.unwrap()["run"], json!(2));

        drop(tx);
        handle.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_ends_monitoring() {
        let (scheduler, runs, recorder, _rendered) = scheduler(Some(1));
        let (tx, rx) = mpsc::channel(16);
        tx.send(WatchEvent::Change).await.unwrap();
        tx.send(WatchEvent::Change).await.unwrap();

        let err = scheduler.run(rx).await.unwrap_err();
        assert!(matches!(err, ComponentError::Failed { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(recorder.lines.lock().is_empty());
        drop(tx);
    }

    #[test]
    fn test_state_directory_is_ignored() {
        let source = NotifyChangeSource::default();
        assert!(source.is_ignored(Path::new("/project/.serverless/state.json")));
        assert!(!source.is_ignored(Path::new("/project/serverless.yml")));
    }

    #[test]
    fn test_only_modifications_are_changes() {
        use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};

        assert!(is_change(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(is_change(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_change(&EventKind::Create(CreateKind::File)));
        assert!(!is_change(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_change(&EventKind::Any));
    }

    #[test]
    fn test_invalid_ignore_pattern() {
        assert!(matches!(
            NotifyChangeSource::with_ignore_pattern("(unclosed"),
            Err(WatchError::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn test_notify_source_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = NotifyChangeSource::default().watch(dir.path()).unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.events.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(WatchEvent::Ready));
    }
}
