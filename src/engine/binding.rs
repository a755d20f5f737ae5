use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::Serialize;

use crate::core::{ArcStr, Value};

/// Identifier of an axis, unique within a [`Blueprint`](crate::Blueprint).
///
/// Axis names may be reused after a combine; the identifier never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AxisId(pub(crate) usize);

/// A placeholder for the value a node will produce.
///
/// A `LazyRef` is the identity `(producer, output)`. Binding it as the input
/// of another node is what creates a dependency edge; the graph stores no
/// edges of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LazyRef {
    pub(crate) node: ArcStr,
    pub(crate) output: ArcStr,
}

impl LazyRef {
    /// References `output` of the node named `node`. The reference is only
    /// checked when a node binding it is added to a graph.
    pub fn new(node: impl AsRef<str>, output: impl AsRef<str>) -> Self {
        Self {
            node: Arc::from(node.as_ref()),
            output: Arc::from(output.as_ref()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl Display for LazyRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

/// The N-wide stream of values of an open split axis.
///
/// Returned by [`Blueprint::split`](crate::Blueprint::split). A node bound to
/// a stream receives, in each of its instances, the one axis value that
/// instance was replicated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub(crate) axis: AxisId,
    pub(crate) name: ArcStr,
    pub(crate) width: usize,
}

impl Stream {
    /// Name of the axis this stream iterates.
    pub fn axis(&self) -> &str {
        &self.name
    }

    /// Number of values on the axis.
    pub fn width(&self) -> usize {
        self.width
    }
}

/// What a node input is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A value known at authoring time.
    Literal(Value),
    /// The future output of another node.
    Lazy(LazyRef),
    /// The per-instance value of a split axis.
    Stream(Stream),
}

impl Binding {
    /// Binds any serializable value as a literal.
    pub fn literal<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Binding::Literal(serde_json::to_value(value)?))
    }
}

impl From<LazyRef> for Binding {
    fn from(value: LazyRef) -> Self {
        Binding::Lazy(value)
    }
}

impl From<&LazyRef> for Binding {
    fn from(value: &LazyRef) -> Self {
        Binding::Lazy(value.clone())
    }
}

impl From<Stream> for Binding {
    fn from(value: Stream) -> Self {
        Binding::Stream(value)
    }
}

impl From<&Stream> for Binding {
    fn from(value: &Stream) -> Self {
        Binding::Stream(value.clone())
    }
}

macro_rules! impl_literal {
    ($($T:ty),*) => {
        $(
            impl From<$T> for Binding {
                fn from(value: $T) -> Self {
                    Binding::Literal(Value::from(value))
                }
            }
        )*
    };
}

impl_literal!(bool, i32, i64, u32, u64, usize, f64, String, &str, Value, Vec<Value>);

impl From<&camino::Utf8Path> for Binding {
    fn from(value: &camino::Utf8Path) -> Self {
        Binding::Literal(Value::from(value.as_str()))
    }
}

impl From<camino::Utf8PathBuf> for Binding {
    fn from(value: camino::Utf8PathBuf) -> Self {
        Binding::Literal(Value::from(value.into_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_conversions() {
        assert_eq!(Binding::from(10), Binding::Literal(Value::from(10)));
        assert_eq!(Binding::from("a"), Binding::Literal(Value::from("a")));

        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let binding = Binding::literal(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(binding, Binding::Literal(serde_json::json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_lazy_ref_display() {
        let lazy = LazyRef::new("increment0", "out");
        assert_eq!(lazy.to_string(), "increment0.out");
        assert_eq!(Binding::from(&lazy), Binding::Lazy(lazy));
    }
}
