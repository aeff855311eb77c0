//! Execution context handed to components
//!
//! A context owns everything a run renders to the user: status lines, outputs,
//! errors and the closing summary. The coordinator and the watch scheduler
//! share one context per run but never touch it concurrently.

use std::error::Error;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Reset, RgbColor, Style};
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;

/// Name of the per-project state directory handed to components.
pub const STATE_DIR: &str = ".serverless";

const ACCENT_RGB: (u8, u8, u8) = (207, 106, 76);

const PRIMARY_COLOR: Style = Style::new().fg_color(Some(anstyle::Color::Rgb(RgbColor(
    ACCENT_RGB.0,
    ACCENT_RGB.1,
    ACCENT_RGB.2,
))));
const SUCCESS_COLOR: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Green)));
const ERROR_COLOR: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Red)));
const DIM_COLOR: Style = Style::new().dimmed();

/// Settings for a single run, fixed once the context is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub root: PathBuf,
    /// Where components keep their own state (`<root>/.serverless`)
    pub state_root: PathBuf,
    pub debug: bool,
    /// Name of the root component's constructor
    pub entity: String,
}

impl RunConfig {
    #[must_use]
    pub fn new(root: PathBuf, debug: bool, entity: impl Into<String>) -> Self {
        let state_root = root.join(STATE_DIR);
        Self {
            root,
            state_root,
            debug,
            entity: entity.into(),
        }
    }
}

/// How a run ended, reported through [`Context::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Done,
    Error,
}

impl CloseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseStatus::Done => "done",
            CloseStatus::Error => "error",
        }
    }
}

/// Rendering and shutdown bookkeeping for one run.
pub trait Context: Send + Sync {
    fn config(&self) -> &RunConfig;

    fn status(&self, message: &str);

    fn render_outputs(&self, outputs: &Value);

    fn render_error(&self, error: &dyn Error);

    /// Finish the run. `error` is only set together with [`CloseStatus::Error`].
    fn close(&self, status: CloseStatus, error: Option<&dyn Error>);
}

/// Builds the context for a run once its [`RunConfig`] is known.
pub trait ContextFactory: Send + Sync {
    fn create(&self, config: RunConfig) -> Arc<dyn Context>;
}

impl<F> ContextFactory for F
where
    F: Fn(RunConfig) -> Arc<dyn Context> + Send + Sync,
{
    fn create(&self, config: RunConfig) -> Arc<dyn Context> {
        self(config)
    }
}

/// Context that renders to a terminal (or any writer).
pub struct TerminalContext {
    config: RunConfig,
    out: Mutex<Box<dyn Write + Send>>,
    color: bool,
    started: Instant,
}

impl TerminalContext {
    /// Render to stdout, with colour only when stdout is a terminal and `NO_COLOR` is unset.
    #[must_use]
    pub fn stdout(config: RunConfig) -> Self {
        let color = std::env::var_os("NO_COLOR").is_none() && std::io::stdout().is_terminal();
        Self::with_writer(config, Box::new(std::io::stdout()), color)
    }

    #[must_use]
    pub fn with_writer(config: RunConfig, out: Box<dyn Write + Send>, color: bool) -> Self {
        Self {
            config,
            out: Mutex::new(out),
            color,
            started: Instant::now(),
        }
    }

    fn paint(&self, style: Style, s: &str) -> String {
        if self.color {
            format!("{style}{s}{Reset}")
        } else {
            s.to_string()
        }
    }

    fn arrow(&self) -> String {
        self.paint(PRIMARY_COLOR, "❱")
    }

    fn write_block(&self, text: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{text}").and_then(|()| out.flush()) {
            debug!("Failed to write to terminal: {e}");
        }
    }
}

impl Context for TerminalContext {
    fn config(&self) -> &RunConfig {
        &self.config
    }

    fn status(&self, message: &str) {
        let entity = self.paint(DIM_COLOR, &self.config.entity);
        self.write_block(&format!("{} {entity} {message}", self.arrow()));
    }

    fn render_outputs(&self, outputs: &Value) {
        if outputs.is_null() {
            return;
        }
        let rendered = match serde_yaml::to_string(outputs) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!("Unable to render outputs as YAML: {e}");
                serde_json::to_string_pretty(outputs).unwrap_or_else(|_| outputs.to_string())
            }
        };
        self.write_block(rendered.trim_end());
    }

    fn render_error(&self, error: &dyn Error) {
        let mut text = format!("{} {error}", self.paint(ERROR_COLOR, "✘"));
        let mut source = error.source();
        while let Some(cause) = source {
            text.push_str(&format!("\n  caused by: {cause}"));
            source = cause.source();
        }
        if self.config.debug {
            text.push_str(&format!("\n{}", self.paint(DIM_COLOR, &format!("{error:?}"))));
        }
        self.write_block(&text);
    }

    fn close(&self, status: CloseStatus, error: Option<&dyn Error>) {
        if let Some(error) = error {
            debug!("Closing {} with error: {error}", self.config.entity);
        }
        let mark = match status {
            CloseStatus::Done => self.paint(SUCCESS_COLOR, "✓"),
            CloseStatus::Error => self.paint(ERROR_COLOR, "✘"),
        };
        let elapsed = self.paint(
            DIM_COLOR,
            &format!("({})", format_duration(self.started.elapsed())),
        );
        self.write_block(&format!(
            "\n{} {} {mark} {elapsed}",
            self.arrow(),
            status.as_str()
        ));
    }
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let tenths = d.subsec_millis() / 100;
    if total_secs < 60 {
        format!("{total_secs}.{tenths}s")
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{mins}m {secs}.{tenths}s")
    }
}
