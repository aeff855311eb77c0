//! Built-in template root component
//!
//! When the configuration is a declarative template, the coordinator runs this
//! component with the parsed template as its `template` input. Running it
//! produces the deployment plan: every member carrying a `component` attribute
//! becomes an instance, `${alias.…}` references between instances become
//! dependencies, and instances are listed dependencies-first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::classify::truthy;
use crate::component::{Component, ComponentConstructor, ComponentError};
use crate::context::Context;
use crate::inputs::Inputs;

/// Entity name of the template root component.
pub const TEMPLATE_COMPONENT: &str = "Template";

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([A-Za-z0-9_-]+)\.").expect("valid reference pattern"));

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Missing `template` input")]
    MissingTemplate,
    #[error("Circular reference detected involving '{0}'")]
    Cycle(String),
}

impl From<TemplateError> for ComponentError {
    fn from(e: TemplateError) -> Self {
        ComponentError::Failed {
            component: TEMPLATE_COMPONENT.to_string(),
            message: e.to_string(),
        }
    }
}

/// One component instance declared in a template.
#[derive(Debug)]
struct Instance<'a> {
    alias: &'a str,
    component: &'a Value,
    inputs: Value,
    depends_on: Vec<&'a str>,
}

fn collect_references<'a>(value: &'a Value, found: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => {
            for capture in REFERENCE.captures_iter(s) {
                if let Some(alias) = capture.get(1) {
                    found.push(alias.as_str());
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

fn instances(template: &Map<String, Value>) -> Vec<Instance<'_>> {
    let aliases: HashSet<&str> = template
        .iter()
        .filter(|(_, member)| member.get("component").is_some_and(truthy))
        .map(|(alias, _)| alias.as_str())
        .collect();

    template
        .iter()
        .filter(|(alias, _)| aliases.contains(alias.as_str()))
        .map(|(alias, member)| {
            let inputs = member
                .get("inputs")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            let mut references = Vec::new();
            if let Some(raw) = member.get("inputs") {
                collect_references(raw, &mut references);
            }
            let mut depends_on: Vec<&str> = Vec::new();
            for reference in references {
                if aliases.contains(reference) && !depends_on.contains(&reference) {
                    depends_on.push(reference);
                }
            }
            Instance {
                alias: alias.as_str(),
                component: &member["component"],
                inputs,
                depends_on,
            }
        })
        .collect()
}

/// Order instances dependencies-first, keeping template order among peers.
fn topo_sort<'t, 'a>(instances: &'t [Instance<'a>]) -> Result<Vec<&'t Instance<'a>>, TemplateError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for instance in instances {
        in_degree.insert(instance.alias, instance.depends_on.len());
        for &dep in &instance.depends_on {
            dependents.entry(dep).or_default().push(instance.alias);
        }
    }

    let by_alias: HashMap<&str, &Instance> = instances.iter().map(|i| (i.alias, i)).collect();
    let mut queue: VecDeque<&str> = instances
        .iter()
        .filter(|i| i.depends_on.is_empty())
        .map(|i| i.alias)
        .collect();

    let mut result = Vec::with_capacity(instances.len());
    while let Some(alias) = queue.pop_front() {
        if let Some(instance) = by_alias.get(alias) {
            result.push(*instance);
        }
        if let Some(next) = dependents.get(alias) {
            for &dependent in next {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
    }

    if result.len() < instances.len() {
        let stuck = instances
            .iter()
            .find(|i| in_degree.get(i.alias).is_some_and(|deg| *deg > 0))
            .map_or_else(String::new, |i| i.alias.to_string());
        return Err(TemplateError::Cycle(stuck));
    }
    Ok(result)
}

/// Build the ordered deployment plan for a template.
///
/// # Errors
///
/// Returns `TemplateError::Cycle` if instances reference each other in a loop.
pub fn plan(template: &Map<String, Value>) -> Result<Value, TemplateError> {
    let instances = instances(template);
    let ordered = topo_sort(&instances)?;

    let mut plan = Map::new();
    for instance in ordered {
        plan.insert(
            instance.alias.to_string(),
            json!({
                "component": instance.component,
                "inputs": instance.inputs,
                "dependsOn": instance.depends_on,
            }),
        );
    }
    Ok(Value::Object(plan))
}

/// Constructor for the template root component.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateConstructor;

impl ComponentConstructor for TemplateConstructor {
    fn name(&self) -> &str {
        TEMPLATE_COMPONENT
    }

    fn construct(&self, _id: Option<String>, context: Arc<dyn Context>) -> Box<dyn Component> {
        Box::new(TemplateComponent { context })
    }
}

pub struct TemplateComponent {
    context: Arc<dyn Context>,
}

#[async_trait]
impl Component for TemplateComponent {
    async fn init(&mut self) -> Result<(), ComponentError> {
        debug!(
            "Template component state root: {}",
            self.context.config().state_root.display()
        );
        Ok(())
    }

    async fn invoke(&mut self, inputs: Inputs) -> Result<Value, ComponentError> {
        let template = inputs
            .get("template")
            .and_then(Value::as_object)
            .ok_or(TemplateError::MissingTemplate)?;
        let plan = plan(template)?;
        let count = plan.as_object().map_or(0, Map::len);
        self.context
            .status(&format!("Planned {count} component instance(s)"));
        Ok(plan)
    }

    async fn call_method(&mut self, name: &str, _inputs: Inputs) -> Result<Value, ComponentError> {
        Err(ComponentError::MethodNotFound(name.to_string()))
    }
}
