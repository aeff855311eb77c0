//! Command-line inputs
//!
//! Arguments after the binary's own options are parsed the way most Node CLIs
//! parse them: `--key=value`, `--key value`, `--flag`, `--no-flag`, short flag
//! groups and `--` to end option parsing. The first positional token names the
//! method to call; the positional list itself never reaches the component.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::classify::truthy;

/// Flag map handed to a component invocation.
pub type Inputs = Map<String, Value>;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?$").expect("valid number pattern")
});

/// Method name and inputs extracted from the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArgs {
    pub method: Option<String>,
    pub inputs: Inputs,
}

/// Parse raw arguments into a method name and an inputs map.
#[must_use]
pub fn parse_args<I, S>(args: I) -> ParsedArgs
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    let mut inputs = Inputs::new();
    let mut positionals: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let next = args.get(i + 1).map(String::as_str).filter(|n| takes_value(n));

        if arg == "--" {
            positionals.extend(args[i + 1..].iter().map(String::as_str));
            break;
        } else if let Some(long) = arg.strip_prefix("--") {
            if let Some((key, value)) = long.split_once('=') {
                set_input(&mut inputs, key, coerce(value));
            } else if let Some(key) = long.strip_prefix("no-") {
                set_input(&mut inputs, key, Value::Bool(false));
            } else if let Some(value) = next {
                set_input(&mut inputs, long, coerce_separate(value));
                i += 1;
            } else {
                set_input(&mut inputs, long, Value::Bool(true));
            }
        } else if let Some(short) = arg.strip_prefix('-').filter(|s| is_short_group(s)) {
            let letters: Vec<char> = short.chars().collect();
            if let Some((last, rest)) = letters.split_last() {
                for letter in rest {
                    set_input(&mut inputs, &letter.to_string(), Value::Bool(true));
                }
                if let Some(value) = next {
                    set_input(&mut inputs, &last.to_string(), coerce_separate(value));
                    i += 1;
                } else {
                    set_input(&mut inputs, &last.to_string(), Value::Bool(true));
                }
            }
        } else {
            positionals.push(arg);
        }
        i += 1;
    }

    ParsedArgs {
        method: positionals.first().map(|m| (*m).to_string()),
        inputs,
    }
}

/// Whether a flag is set, using the same truthiness as the configuration checks.
#[must_use]
pub fn flag(inputs: &Inputs, name: &str) -> bool {
    inputs.get(name).is_some_and(truthy)
}

fn takes_value(next: &str) -> bool {
    !next.starts_with('-')
}

fn is_short_group(s: &str) -> bool {
    !s.is_empty() && !NUMBER.is_match(s)
}

fn coerce(value: &str) -> Value {
    if NUMBER.is_match(value) {
        if let Ok(n) = value.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Some(n) = value.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(value.to_string())
}

fn coerce_separate(value: &str) -> Value {
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => coerce(value),
    }
}

/// Insert `value` at a possibly dotted `key`; repeated keys collect into an array.
fn set_input(inputs: &mut Inputs, key: &str, value: Value) {
    let (path, leaf) = match key.rsplit_once('.') {
        Some((path, leaf)) => (Some(path), leaf),
        None => (None, key),
    };

    let mut target = inputs;
    for part in path.into_iter().flat_map(|p| p.split('.')) {
        let entry = target
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        target = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }

    match target.get_mut(leaf) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
        None => {
            target.insert(leaf.to_string(), value);
        }
    }
}
