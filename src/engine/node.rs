use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Value};
use crate::engine::{Binding, LazyRef};
use crate::error::InvalidInput;

/// Result returned by a task body.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Executable body of a task. Bodies are expected to be pure: the same inputs
/// must produce equivalent outputs, which is what makes caching sound.
pub(crate) type Body = Arc<dyn Fn(&Inputs) -> TaskResult<Outputs> + Send + Sync>;

/// An immutable description of one unit of work.
///
/// Built with [`TaskNode::builder`] and added to a graph with
/// [`Blueprint::add_node`](crate::Blueprint::add_node).
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) name: ArcStr,
    pub(crate) inputs: BTreeMap<String, Binding>,
    pub(crate) outputs: Vec<String>,
    pub(crate) body: Body,
    pub(crate) version: Option<String>,
    pub(crate) tracked: BTreeSet<String>,
    pub(crate) identify_by: Option<String>,
}

impl TaskNode {
    pub fn builder(name: impl AsRef<str>) -> NodeBuilder {
        NodeBuilder {
            name: Arc::from(name.as_ref()),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            version: None,
            tracked: BTreeSet::new(),
            identify_by: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.inputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn declares(&self, output: &str) -> bool {
        self.outputs.iter().any(|o| o == output)
    }

    /// Every lazy reference among the inputs.
    pub(crate) fn references(&self) -> impl Iterator<Item = &LazyRef> {
        self.inputs.values().filter_map(|binding| match binding {
            Binding::Lazy(lazy) => Some(lazy),
            _ => None,
        })
    }
}

impl Debug for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

pub struct NodeBuilder {
    name: ArcStr,
    inputs: BTreeMap<String, Binding>,
    outputs: Vec<String>,
    version: Option<String>,
    tracked: BTreeSet<String>,
    identify_by: Option<String>,
}

impl NodeBuilder {
    /// Binds an input to a literal, a [`LazyRef`] or a [`Stream`](crate::Stream).
    /// Binding the same name twice keeps the last binding.
    pub fn input(mut self, name: impl Into<String>, binding: impl Into<Binding>) -> Self {
        self.inputs.insert(name.into(), binding.into());
        self
    }

    /// Declares an output the body must produce.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.outputs.contains(&name) {
            self.outputs.push(name);
        }
        self
    }

    pub fn outputs<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names.into_iter().fold(self, |builder, name| builder.output(name))
    }

    /// Mixed into the fingerprint. Bump it after changing what the body does
    /// to stop cached results of the old body from being reused.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Marks an input as naming files. Its fingerprint then covers the content
    /// of every file path found in the bound value, not only the path itself.
    pub fn track_file(mut self, input: impl Into<String>) -> Self {
        self.tracked.insert(input.into());
        self
    }

    /// Uses the resolved value of `input` to identify instances in telemetry.
    pub fn identify_by(mut self, input: impl Into<String>) -> Self {
        self.identify_by = Some(input.into());
        self
    }

    /// Finishes the node with its body.
    pub fn run<F>(self, body: F) -> TaskNode
    where
        F: Fn(&Inputs) -> TaskResult<Outputs> + Send + Sync + 'static,
    {
        TaskNode {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            body: Arc::new(body),
            version: self.version,
            tracked: self.tracked,
            identify_by: self.identify_by,
        }
    }
}

/// The resolved inputs of one node instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Inputs {
    pub(crate) values: BTreeMap<String, Value>,
}

impl Inputs {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Returns the raw value bound to `name`.
    pub fn value(&self, name: &str) -> Result<&Value, InvalidInput> {
        self.values
            .get(name)
            .ok_or_else(|| InvalidInput::new(name, "no such input"))
    }

    /// Deserializes the value bound to `name` into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, InvalidInput> {
        let value = self.value(name)?;
        T::deserialize(value).map_err(|err| InvalidInput::new(name, err))
    }

    /// Borrows the value bound to `name` as a string.
    pub fn str(&self, name: &str) -> Result<&str, InvalidInput> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| InvalidInput::new(name, "expected a string"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/// The named outputs produced by a task body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Outputs(BTreeMap<String, Value>);

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Like [`Outputs::with`], for any serializable value.
    pub fn try_with<T: Serialize>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(self.with(name, serde_json::to_value(value)?))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keeps only the declared outputs. Returns the first declared output the
    /// body failed to produce, if any.
    pub(crate) fn conform(&mut self, node: &str, declared: &[String]) -> Result<(), String> {
        if let Some(missing) = declared.iter().find(|name| !self.0.contains_key(*name)) {
            return Err(missing.clone());
        }

        self.0.retain(|name, _| {
            let keep = declared.contains(name);
            if !keep {
                tracing::warn!("Node {} produced undeclared output '{}', dropped", node, name);
            }
            keep
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(items: Vec<(&str, Value)>) -> Inputs {
        Inputs::new(items.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_typed_access() {
        let inputs = inputs(vec![("x", json!(10)), ("f", json!("a.nii"))]);
        assert_eq!(inputs.get::<i64>("x").unwrap(), 10);
        assert_eq!(inputs.str("f").unwrap(), "a.nii");
    }

    #[test]
    fn test_wrong_shape_is_invalid_input() {
        let inputs = inputs(vec![("x", json!("ten"))]);

        let err = inputs.get::<i64>("x").unwrap_err();
        assert_eq!(err.input, "x");

        let err = inputs.get::<i64>("y").unwrap_err();
        assert_eq!(err.reason, "no such input");
    }

    #[test]
    fn test_conform_outputs() {
        let declared = vec!["out".to_string()];

        let mut outputs = Outputs::new().with("out", 1).with("extra", 2);
        outputs.conform("n", &declared).unwrap();
        assert_eq!(outputs, Outputs::new().with("out", 1));

        let mut outputs = Outputs::new().with("other", 1);
        assert_eq!(outputs.conform("n", &declared), Err("out".to_string()));
    }

    #[test]
    fn test_builder_dedupes_outputs() {
        let node = TaskNode::builder("n")
            .input("x", 1)
            .outputs(["out", "out", "log"])
            .run(|_| Ok(Outputs::new()));

        assert_eq!(node.outputs(), ["out".to_string(), "log".to_string()]);
        assert!(node.declares("log"));
        assert_eq!(node.references().count(), 0);
    }
}
