use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, Value};
use crate::engine::{AxisId, Binding, LazyRef, Stream, TaskNode};
use crate::error::GraphError;

/// A node stored in the graph, together with its cardinality: the stack of
/// axes that were open when it was added. An empty stack means the node runs
/// exactly once.
#[derive(Clone, Debug)]
pub(crate) struct Slot {
    pub(crate) node: TaskNode,
    pub(crate) axes: Vec<AxisId>,
}

#[derive(Clone, Debug)]
pub(crate) struct Axis {
    pub(crate) name: ArcStr,
    pub(crate) values: Arc<[Value]>,
}

/// Handle to a node added to a [`Blueprint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    name: ArcStr,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lazy reference to one of this node's outputs.
    pub fn out(&self, output: impl AsRef<str>) -> LazyRef {
        LazyRef::new(&*self.name, output)
    }
}

/// The blueprint of a workflow.
///
/// `Blueprint` accumulates [`TaskNode`]s and derives the dependency edges from
/// the [`LazyRef`]s they bind. Because a reference may only name a node that
/// is already present, the graph is acyclic by construction; `finalize` still
/// runs a topological check before handing out a [`Workflow`].
///
/// # Split and combine
///
/// [`Blueprint::split`] opens an axis over a collection of values. Every node
/// added while the axis is open is replicated once per value at run time.
/// [`Blueprint::combine`] closes the axis: nodes added afterwards that
/// reference a replicated node receive the ordered sequence of its values.
///
/// # Example
///
/// ```rust
/// use kumiki::{Blueprint, Outputs, TaskNode};
///
/// let mut blueprint = Blueprint::new();
/// let stream = blueprint.split("x", [1, 2, 3])?;
///
/// let double = blueprint.add_node(
///     TaskNode::builder("double")
///         .input("x", &stream)
///         .output("out")
///         .run(|inputs| Ok(Outputs::new().with("out", inputs.get::<i64>("x")? * 2))),
/// )?;
///
/// blueprint.combine("x")?;
/// let workflow = blueprint.finalize([("doubled", double.out("out"))])?;
/// assert_eq!(workflow.width("double"), Some(3));
/// # Ok::<(), kumiki::GraphError>(())
/// ```
#[derive(Default)]
pub struct Blueprint {
    pub(crate) graph: Graph<Slot, ()>,
    names: HashMap<ArcStr, NodeIndex>,
    axes: Vec<Axis>,
    open: Vec<AxisId>,
    counters: HashMap<String, usize>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, deriving an edge from every producer it references.
    pub fn add_node(&mut self, node: TaskNode) -> Result<NodeHandle, GraphError> {
        if self.names.contains_key(&node.name) {
            return Err(GraphError::DuplicateName(node.name.to_string()));
        }

        let mut producers = Vec::new();

        for lazy in node.references() {
            if lazy.node == node.name {
                return Err(GraphError::Cycle(vec![
                    node.name.to_string(),
                    node.name.to_string(),
                ]));
            }

            let &index =
                self.names
                    .get(&lazy.node)
                    .ok_or_else(|| GraphError::DanglingReference {
                        node: node.name.to_string(),
                        producer: lazy.node.to_string(),
                    })?;

            if !self.graph[index].node.declares(&lazy.output) {
                return Err(GraphError::UnknownOutput {
                    producer: lazy.node.to_string(),
                    output: lazy.output.to_string(),
                });
            }

            producers.push(index);
        }

        for binding in node.inputs.values() {
            if let Binding::Stream(stream) = binding
                && !self.open.contains(&stream.axis)
            {
                return Err(GraphError::NoActiveSplit(stream.name.to_string()));
            }
        }

        let name = node.name.clone();
        let index = self.graph.add_node(Slot {
            node,
            axes: self.open.clone(),
        });

        for producer in producers {
            self.graph.update_edge(producer, index, ());
        }

        self.names.insert(name.clone(), index);
        tracing::debug!("Added node {} ({} open axes)", name, self.open.len());

        Ok(NodeHandle { name })
    }

    /// Opens an axis over `values`. Nodes added until the matching
    /// [`combine`](Blueprint::combine) run once per value.
    pub fn split<I, V>(&mut self, axis: &str, values: I) -> Result<Stream, GraphError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if self.find_open(axis).is_some() {
            return Err(GraphError::AxisAlreadyOpen(axis.to_string()));
        }

        let id = AxisId(self.axes.len());
        let values: Arc<[Value]> = values.into_iter().map(Into::into).collect();
        let name: ArcStr = Arc::from(axis);
        let width = values.len();

        self.axes.push(Axis {
            name: name.clone(),
            values,
        });
        self.open.push(id);

        Ok(Stream { axis: id, name, width })
    }

    /// Closes the innermost axis, which must be named `axis`.
    pub fn combine(&mut self, axis: &str) -> Result<(), GraphError> {
        let position = self
            .find_open(axis)
            .ok_or_else(|| GraphError::NoActiveSplit(axis.to_string()))?;

        if position + 1 != self.open.len() {
            let inner = self.open[self.open.len() - 1];
            return Err(GraphError::AxisNotInnermost {
                axis: axis.to_string(),
                inner: self.axes[inner.0].name.to_string(),
            });
        }

        self.open.pop();
        Ok(())
    }

    /// Stream of an axis that is currently open.
    pub fn stream(&self, axis: &str) -> Option<Stream> {
        let position = self.find_open(axis)?;
        let id = self.open[position];
        let axis = &self.axes[id.0];

        Some(Stream {
            axis: id,
            name: axis.name.clone(),
            width: axis.values.len(),
        })
    }

    /// Looks a node up by name.
    pub fn handle(&self, name: &str) -> Option<NodeHandle> {
        self.names
            .get_key_value(name)
            .map(|(name, _)| NodeHandle { name: name.clone() })
    }

    /// Generates `prefix0`, `prefix1`, ... skipping names already taken.
    /// Useful for nodes added in a loop.
    pub fn generate_name(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_default();

        loop {
            let name = format!("{prefix}{counter}");
            *counter += 1;

            if !self.names.contains_key(name.as_str()) {
                return name;
            }
        }
    }

    /// Declares the workflow's external results as `(alias, reference)` pairs
    /// and freezes the graph. The blueprint itself is left untouched, so a
    /// failed call can be fixed and retried.
    pub fn finalize<I, S>(&self, outputs: I) -> Result<Workflow, GraphError>
    where
        I: IntoIterator<Item = (S, LazyRef)>,
        S: Into<String>,
    {
        let mut declared = Vec::new();
        let mut seen = HashSet::new();

        for (alias, lazy) in outputs {
            let alias = alias.into();

            if !seen.insert(alias.clone()) {
                return Err(GraphError::DuplicateOutput(alias));
            }

            let &node = self
                .names
                .get(&lazy.node)
                .ok_or_else(|| GraphError::UnknownNode(lazy.node.to_string()))?;

            if !self.graph[node].node.declares(&lazy.output) {
                return Err(GraphError::UnknownOutput {
                    producer: lazy.node.to_string(),
                    output: lazy.output.to_string(),
                });
            }

            declared.push(WorkflowOutput {
                alias,
                node,
                output: lazy.output.clone(),
            });
        }

        if let Err(cycle) = toposort(&self.graph, None) {
            let name = self.graph[cycle.node_id()].node.name.to_string();
            return Err(GraphError::Cycle(vec![name.clone(), name]));
        }

        Ok(Workflow {
            graph: self.graph.clone(),
            names: self.names.clone(),
            axes: self.axes.clone(),
            outputs: declared,
        })
    }

    fn find_open(&self, axis: &str) -> Option<usize> {
        self.open
            .iter()
            .rposition(|id| &*self.axes[id.0].name == axis)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct WorkflowOutput {
    pub(crate) alias: String,
    pub(crate) node: NodeIndex,
    pub(crate) output: ArcStr,
}

/// A finalized, validated workflow, ready to be run by a
/// [`Submitter`](crate::Submitter).
#[derive(Clone, Debug)]
pub struct Workflow {
    pub(crate) graph: Graph<Slot, ()>,
    pub(crate) names: HashMap<ArcStr, NodeIndex>,
    pub(crate) axes: Vec<Axis>,
    pub(crate) outputs: Vec<WorkflowOutput>,
}

impl Workflow {
    /// Number of nodes, before any split expansion.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node names in construction order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.graph.node_weights().map(|slot| slot.node.name())
    }

    /// Aliases of the declared outputs.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|output| output.alias.as_str())
    }

    /// Number of instances the node will expand to.
    pub fn width(&self, node: &str) -> Option<usize> {
        let &index = self.names.get(node)?;
        Some(self.shape(index).iter().product())
    }

    pub(crate) fn shape(&self, index: NodeIndex) -> Vec<usize> {
        self.graph[index]
            .axes
            .iter()
            .map(|axis| self.axes[axis.0].values.len())
            .collect()
    }
}

impl Display for Workflow {
    /// Renders the graph as a Mermaid diagram.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let slot = &self.graph[index];
            let name = slot.node.name().replace('"', "\\\"");

            if slot.axes.is_empty() {
                writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
            } else {
                let axes: Vec<_> = slot
                    .axes
                    .iter()
                    .map(|axis| self.axes[axis.0].name.to_string())
                    .collect();
                writeln!(
                    f,
                    "    {}[[\"{}\\n× {}\"]]",
                    index.index(),
                    name,
                    axes.join(" × ")
                )?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        for output in &self.outputs {
            writeln!(f, "    {} --> Output", output.node.index())?;
        }

        writeln!(f, "    Output[Output]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outputs;

    fn node(name: &str) -> crate::engine::NodeBuilder {
        TaskNode::builder(name).output("out")
    }

    fn identity(builder: crate::engine::NodeBuilder) -> TaskNode {
        builder.run(|_| Ok(Outputs::new().with("out", 0)))
    }

    #[test]
    fn test_duplicate_name() {
        let mut blueprint = Blueprint::new();
        blueprint.add_node(identity(node("a"))).unwrap();

        let err = blueprint.add_node(identity(node("a"))).unwrap_err();
        assert_eq!(err, GraphError::DuplicateName("a".into()));
        assert_eq!(blueprint.graph.node_count(), 1);
    }

    #[test]
    fn test_dangling_reference() {
        let mut blueprint = Blueprint::new();
        let err = blueprint
            .add_node(identity(node("b").input("x", LazyRef::new("a", "out"))))
            .unwrap_err();

        assert_eq!(
            err,
            GraphError::DanglingReference {
                node: "b".into(),
                producer: "a".into()
            }
        );
    }

    #[test]
    fn test_unknown_output() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_node(identity(node("a"))).unwrap();

        let err = blueprint
            .add_node(identity(node("b").input("x", a.out("missing"))))
            .unwrap_err();

        assert!(matches!(err, GraphError::UnknownOutput { .. }));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut blueprint = Blueprint::new();
        let err = blueprint
            .add_node(identity(node("a").input("x", LazyRef::new("a", "out"))))
            .unwrap_err();

        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn test_edges_are_derived_from_references() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_node(identity(node("a"))).unwrap();
        let b = blueprint
            .add_node(identity(node("b").input("x", a.out("out")).input("y", a.out("out"))))
            .unwrap();
        blueprint
            .add_node(identity(node("c").input("x", b.out("out"))))
            .unwrap();

        // Two references to the same producer make a single edge.
        assert_eq!(blueprint.graph.edge_count(), 2);
    }

    #[test]
    fn test_combine_without_split() {
        let mut blueprint = Blueprint::new();
        assert_eq!(
            blueprint.combine("x"),
            Err(GraphError::NoActiveSplit("x".into()))
        );
    }

    #[test]
    fn test_combine_must_close_innermost() {
        let mut blueprint = Blueprint::new();
        blueprint.split("outer", [1, 2]).unwrap();
        blueprint.split("inner", [1, 2, 3]).unwrap();

        assert!(matches!(
            blueprint.combine("outer"),
            Err(GraphError::AxisNotInnermost { .. })
        ));

        blueprint.combine("inner").unwrap();
        blueprint.combine("outer").unwrap();
        assert!(blueprint.open.is_empty());
    }

    #[test]
    fn test_split_twice_on_same_axis() {
        let mut blueprint = Blueprint::new();
        blueprint.split("x", [1]).unwrap();

        assert_eq!(
            blueprint.split("x", [2]).unwrap_err(),
            GraphError::AxisAlreadyOpen("x".into())
        );
    }

    #[test]
    fn test_stream_of_closed_axis() {
        let mut blueprint = Blueprint::new();
        let stream = blueprint.split("x", [1, 2]).unwrap();
        blueprint.combine("x").unwrap();

        let err = blueprint
            .add_node(identity(node("a").input("x", &stream)))
            .unwrap_err();
        assert_eq!(err, GraphError::NoActiveSplit("x".into()));
    }

    #[test]
    fn test_cardinality_follows_open_axes() {
        let mut blueprint = Blueprint::new();
        blueprint.add_node(identity(node("before"))).unwrap();
        let stream = blueprint.split("x", [1, 2, 3]).unwrap();
        let inside = blueprint
            .add_node(identity(node("inside").input("x", &stream)))
            .unwrap();
        blueprint.combine("x").unwrap();
        blueprint
            .add_node(identity(node("after").input("all", inside.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("all", inside.out("out"))]).unwrap();
        assert_eq!(workflow.width("before"), Some(1));
        assert_eq!(workflow.width("inside"), Some(3));
        assert_eq!(workflow.width("after"), Some(1));
    }

    #[test]
    fn test_finalize_unknown_node() {
        let mut blueprint = Blueprint::new();
        blueprint.add_node(identity(node("a"))).unwrap();

        let err = blueprint
            .finalize([("out", LazyRef::new("b", "out"))])
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownNode("b".into()));

        // The blueprint survives a failed finalize.
        let workflow = blueprint
            .finalize([("out", LazyRef::new("a", "out"))])
            .unwrap();
        assert_eq!(workflow.outputs().collect::<Vec<_>>(), ["out"]);
    }

    #[test]
    fn test_finalize_duplicate_alias() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_node(identity(node("a"))).unwrap();

        let err = blueprint
            .finalize([("out", a.out("out")), ("out", a.out("out"))])
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateOutput("out".into()));
    }

    #[test]
    fn test_generate_name_skips_taken() {
        let mut blueprint = Blueprint::new();
        blueprint.add_node(identity(node("increment1"))).unwrap();

        assert_eq!(blueprint.generate_name("increment"), "increment0");
        assert_eq!(blueprint.generate_name("increment"), "increment2");
        assert_eq!(blueprint.generate_name("other"), "other0");
    }

    #[test]
    fn test_handle_lookup() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_node(identity(node("a"))).unwrap();

        assert_eq!(blueprint.handle("a"), Some(a));
        assert_eq!(blueprint.handle("b"), None);
    }

    #[test]
    fn test_display_mermaid() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_node(identity(node("a"))).unwrap();
        let stream = blueprint.split("f", ["x"]).unwrap();
        blueprint
            .add_node(identity(node("b").input("x", a.out("out")).input("f", &stream)))
            .unwrap();

        let workflow = blueprint.finalize([("a", a.out("out"))]).unwrap();
        let text = workflow.to_string();

        assert!(text.starts_with("graph LR"));
        assert!(text.contains("0 --> 1"));
        assert!(text.contains("× f"));
    }
}
