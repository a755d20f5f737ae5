use std::collections::BTreeMap;

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use crate::Workflow;
use crate::core::Value;
use crate::engine::{AxisId, Binding, Inputs};

pub(crate) type InstanceId = usize;

/// One concrete execution of a node: the node replicated for a single
/// combination of its axis values.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) node: NodeIndex,
    /// Per-axis value index, one entry per axis of the node.
    pub(crate) key: Vec<usize>,
    pub(crate) label: String,
    /// Producer instances this instance waits for, sorted and deduplicated.
    pub(crate) deps: Vec<InstanceId>,
}

/// The expansion of a [`Workflow`] into instances.
///
/// Instances of a node are stored contiguously in row-major order of their
/// key, and nodes follow construction order. Instance ids are therefore
/// stable and double as the scheduling tie-breaker.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) instances: Vec<Instance>,
    pub(crate) dependents: Vec<Vec<InstanceId>>,
    offsets: Vec<usize>,
    shapes: Vec<Vec<usize>>,
}

impl Plan {
    pub(crate) fn new(workflow: &Workflow) -> Self {
        let mut plan = Plan {
            instances: Vec::new(),
            dependents: Vec::new(),
            offsets: Vec::with_capacity(workflow.graph.node_count()),
            shapes: Vec::with_capacity(workflow.graph.node_count()),
        };

        // Node indices follow insertion order, so every producer is expanded
        // before its consumers.
        for index in workflow.graph.node_indices() {
            let shape = workflow.shape(index);
            let slot = &workflow.graph[index];

            plan.offsets.push(plan.instances.len());
            plan.shapes.push(shape.clone());

            let mut producers: Vec<_> = workflow
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .collect();
            producers.sort();

            for key in keys(&shape) {
                let mut deps = Vec::new();
                for &producer in &producers {
                    deps.extend(plan.select(workflow, producer, &slot.axes, &key));
                }
                deps.sort_unstable();
                deps.dedup();

                plan.instances.push(Instance {
                    node: index,
                    label: label(slot.node.name(), &key),
                    key,
                    deps,
                });
            }
        }

        plan.dependents = vec![Vec::new(); plan.instances.len()];
        for (id, instance) in plan.instances.iter().enumerate() {
            for &dep in &instance.deps {
                plan.dependents[dep].push(id);
            }
        }

        plan
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }

    /// The instances of `producer` visible from the instance `key` of a
    /// consumer with axes `consumer`, in row-major order.
    ///
    /// Axes shared with the consumer are pinned to the consumer's key. The
    /// producer's remaining axes have all been combined since, so every value
    /// along them is selected.
    pub(crate) fn select(
        &self,
        workflow: &Workflow,
        producer: NodeIndex,
        consumer: &[AxisId],
        key: &[usize],
    ) -> std::ops::Range<InstanceId> {
        let axes = &workflow.graph[producer].axes;
        let shape = &self.shapes[producer.index()];
        let shared = shared_prefix(axes, consumer);

        let block: usize = shape[shared..].iter().product();
        let row = key[..shared]
            .iter()
            .zip(&shape[..shared])
            .fold(0, |acc, (&i, &width)| acc * width + i);

        let start = self.offsets[producer.index()] + row * block;
        start..start + block
    }

    /// Nests the values of a selection into arrays following the combined
    /// axes of the producer. Values keep axis order, never completion order.
    pub(crate) fn gather(
        &self,
        workflow: &Workflow,
        producer: NodeIndex,
        consumer: &[AxisId],
        values: impl IntoIterator<Item = Value>,
    ) -> Value {
        let axes = &workflow.graph[producer].axes;
        let shape = &self.shapes[producer.index()];
        let shared = shared_prefix(axes, consumer);

        nest(&mut values.into_iter(), &shape[shared..])
    }

    /// Resolves the inputs of an instance whose producers are all done.
    pub(crate) fn resolve<F>(&self, workflow: &Workflow, id: InstanceId, output_of: F) -> Inputs
    where
        F: Fn(InstanceId, &str) -> Value,
    {
        let instance = &self.instances[id];
        let slot = &workflow.graph[instance.node];
        let mut values = BTreeMap::new();

        for (name, binding) in &slot.node.inputs {
            let value = match binding {
                Binding::Literal(value) => value.clone(),
                Binding::Stream(stream) => {
                    // Validated on insertion: the node carries every axis it
                    // has a stream of.
                    let position = slot
                        .axes
                        .iter()
                        .position(|axis| *axis == stream.axis)
                        .unwrap_or_default();
                    workflow.axes[stream.axis.0]
                        .values
                        .get(instance.key[position])
                        .cloned()
                        .unwrap_or(Value::Null)
                }
                Binding::Lazy(lazy) => {
                    let producer = workflow.names[&lazy.node];
                    let selection = self.select(workflow, producer, &slot.axes, &instance.key);
                    let items = selection.map(|dep| output_of(dep, &lazy.output));
                    self.gather(workflow, producer, &slot.axes, items)
                }
            };

            values.insert(name.clone(), value);
        }

        Inputs::new(values)
    }
}

fn shared_prefix(a: &[AxisId], b: &[AxisId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn nest(values: &mut impl Iterator<Item = Value>, dims: &[usize]) -> Value {
    match dims.split_first() {
        None => values.next().unwrap_or(Value::Null),
        Some((&width, rest)) => Value::Array((0..width).map(|_| nest(values, rest)).collect()),
    }
}

/// Every key of a shape in row-major order. A scalar shape has one empty key;
/// a shape with a zero-width axis has none.
fn keys(shape: &[usize]) -> Vec<Vec<usize>> {
    shape.iter().fold(vec![Vec::new()], |acc, &width| {
        acc.into_iter()
            .flat_map(|prefix| {
                (0..width).map(move |i| {
                    let mut key = prefix.clone();
                    key.push(i);
                    key
                })
            })
            .collect()
    })
}

fn label(name: &str, key: &[usize]) -> String {
    if key.is_empty() {
        name.to_string()
    } else {
        let key: Vec<_> = key.iter().map(usize::to_string).collect();
        format!("{}[{}]", name, key.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Blueprint, Outputs, TaskNode};
    use serde_json::json;

    fn unit(name: &str) -> crate::engine::NodeBuilder {
        TaskNode::builder(name).output("out")
    }

    fn finish(builder: crate::engine::NodeBuilder) -> TaskNode {
        builder.run(|_| Ok(Outputs::new().with("out", 0)))
    }

    #[test]
    fn test_keys_row_major() {
        assert_eq!(keys(&[]), vec![Vec::<usize>::new()]);
        assert_eq!(
            keys(&[2, 2]),
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]
        );
        assert!(keys(&[3, 0]).is_empty());
    }

    #[test]
    fn test_nest_shapes() {
        let values = (1..=6).map(Value::from);
        assert_eq!(
            nest(&mut values.into_iter(), &[2, 3]),
            json!([[1, 2, 3], [4, 5, 6]])
        );

        let mut empty = std::iter::empty();
        assert_eq!(nest(&mut empty, &[2, 0]), json!([[], []]));
    }

    #[test]
    fn test_chain_under_split_pairs_instances() {
        let mut blueprint = Blueprint::new();
        let stream = blueprint.split("f", ["a", "b", "c"]).unwrap();
        let first = blueprint
            .add_node(finish(unit("first").input("f", &stream)))
            .unwrap();
        blueprint
            .add_node(finish(unit("second").input("x", first.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("x", first.out("out"))]).unwrap();
        let plan = Plan::new(&workflow);

        assert_eq!(plan.len(), 6);
        assert_eq!(plan.instances[4].label, "second[1]");
        assert_eq!(plan.instances[4].deps, vec![1]);
        assert_eq!(plan.dependents[2], vec![5]);
    }

    #[test]
    fn test_combined_consumer_waits_for_all() {
        let mut blueprint = Blueprint::new();
        blueprint.split("f", [1, 2, 3]).unwrap();
        let mapped = blueprint.add_node(finish(unit("map"))).unwrap();
        blueprint.combine("f").unwrap();
        blueprint
            .add_node(finish(unit("reduce").input("all", mapped.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("x", mapped.out("out"))]).unwrap();
        let plan = Plan::new(&workflow);

        assert_eq!(plan.instances[3].label, "reduce");
        assert_eq!(plan.instances[3].deps, vec![0, 1, 2]);

        let inputs = plan.resolve(&workflow, 3, |dep, _| Value::from(dep * 10));
        assert_eq!(inputs.value("all").unwrap(), &json!([0, 10, 20]));
    }

    #[test]
    fn test_nested_axes_combine_inner_only() {
        let mut blueprint = Blueprint::new();
        let outer = blueprint.split("outer", ["a", "b"]).unwrap();
        let inner = blueprint.split("inner", [1, 2, 3]).unwrap();
        let cell = blueprint
            .add_node(finish(
                unit("cell").input("o", &outer).input("i", &inner),
            ))
            .unwrap();
        blueprint.combine("inner").unwrap();
        let row = blueprint
            .add_node(finish(unit("row").input("cells", cell.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("rows", row.out("out"))]).unwrap();
        let plan = Plan::new(&workflow);

        // 6 cells, then 2 rows.
        assert_eq!(plan.len(), 8);
        assert_eq!(plan.instances[7].label, "row[1]");
        assert_eq!(plan.instances[7].deps, vec![3, 4, 5]);

        let inputs = plan.resolve(&workflow, 4, |_, _| Value::Null);
        assert_eq!(inputs.value("o").unwrap(), &json!("b"));
        assert_eq!(inputs.value("i").unwrap(), &json!(2));
    }

    #[test]
    fn test_scalar_producer_is_broadcast() {
        let mut blueprint = Blueprint::new();
        let seed = blueprint.add_node(finish(unit("seed"))).unwrap();
        blueprint.split("f", [1, 2]).unwrap();
        let mapped = blueprint
            .add_node(finish(unit("map").input("seed", seed.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("x", mapped.out("out"))]).unwrap();
        let plan = Plan::new(&workflow);

        assert_eq!(plan.instances[1].deps, vec![0]);
        assert_eq!(plan.instances[2].deps, vec![0]);
        assert_eq!(plan.dependents[0], vec![1, 2]);
    }

    #[test]
    fn test_empty_axis() {
        let mut blueprint = Blueprint::new();
        blueprint.split("f", Vec::<Value>::new()).unwrap();
        let mapped = blueprint.add_node(finish(unit("map"))).unwrap();
        blueprint.combine("f").unwrap();
        blueprint
            .add_node(finish(unit("reduce").input("all", mapped.out("out"))))
            .unwrap();

        let workflow = blueprint.finalize([("x", mapped.out("out"))]).unwrap();
        let plan = Plan::new(&workflow);

        assert_eq!(plan.len(), 1);
        assert!(plan.instances[0].deps.is_empty());

        let inputs = plan.resolve(&workflow, 0, |_, _| Value::Null);
        assert_eq!(inputs.value("all").unwrap(), &json!([]));
    }
}
