use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::Workflow;

/// Timing of one body invocation.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    /// Name of the node the instance belongs to.
    pub node: String,
    pub start: Instant,
    pub duration: Duration,
}

/// Run diagnostics and performance metrics.
///
/// Returned as part of every [`Outcome`](crate::Outcome). Only instances whose
/// body actually ran are recorded; cache hits and failed dependents are not.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Body invocations keyed by instance label.
    pub execution_times: HashMap<String, TaskExecution>,
}

impl Diagnostics {
    /// Total body time per node, with the number of instances that ran.
    pub fn node_times(&self) -> HashMap<&str, (Duration, usize)> {
        let mut acc: HashMap<&str, (Duration, usize)> = HashMap::new();

        for exec in self.execution_times.values() {
            let entry = acc.entry(exec.node.as_str()).or_default();
            entry.0 += exec.duration;
            entry.1 += 1;
        }

        acc
    }

    /// Renders the workflow as a Mermaid diagram, color-coded by the total
    /// body time of each node.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (no instance ran)
    pub fn render_mermaid(&self, workflow: &Workflow) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = self.node_times();

        let (mut min_time, mut max_time) = times
            .values()
            .map(|(total, _)| total.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), t| (lo.min(t), hi.max(t)));

        if min_time > max_time {
            // Nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in workflow.graph.node_indices() {
            let name = workflow.graph[index].node.name();

            let (label_extra, color_code) = match times.get(name) {
                Some(&(total, count)) => {
                    let t = (total.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{total:.2?} × {count}"), heat(t))
                }
                None => ("Cached".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(
                f,
                "    {}[\"{}\\n{}\"]",
                index.index(),
                name.replace('"', "\\\""),
                label_extra
            );
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color_code);
        }

        for edge in workflow.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            );
        }

        if !workflow.outputs.is_empty() {
            let _ = writeln!(f, "    Output[Output]");
            for output in &workflow.outputs {
                let _ = writeln!(
                    f,
                    "    {} -- \"{}\" --> Output",
                    output.node.index(),
                    output.alias.replace('"', "\\\"")
                );
            }
        }

        f
    }
}

/// Maps `t` in `0.0..=1.0` onto green, yellow, red.
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}
