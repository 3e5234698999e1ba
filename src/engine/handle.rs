use std::marker::PhantomData;

use petgraph::graph::NodeIndex;

use crate::core::Dynamic;
use crate::engine::{Binding, Input};

/// A type-safe reference to the result of a node in the task graph.
///
/// A `Handle<T>` is a lightweight, copyable token that represents the future
/// result of type `T`. Downstream nodes hold handles instead of looking up
/// "field X of node Y" by name, so a node can only ever be wired to an
/// upstream result of the type it expects.
///
/// A handle also remembers which [`Blueprint`](crate::Blueprint) produced it.
/// Wiring a handle into a different blueprint is reported as a
/// [`GraphError::Wiring`](crate::GraphError::Wiring) when the graph is
/// finished, never as a panic at run time.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle<T> {
    pub(crate) input: Input,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(graph: u64, index: NodeIndex) -> Self {
        Self {
            input: Input { graph, index },
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the node in its graph.
    pub fn index(&self) -> NodeIndex {
        self.input.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Binding for Handle<T>
where
    T: Send + Sync + 'static,
{
    type Output<'a> = &'a T;

    fn input(&self) -> Input {
        self.input
    }

    fn expected(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn downcast<'a>(&self, output: &'a Dynamic) -> Option<Self::Output<'a>> {
        output.downcast_ref::<T>()
    }
}
