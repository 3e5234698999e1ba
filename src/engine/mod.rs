mod handle;
mod task;

use petgraph::graph::NodeIndex;

use crate::core::Dynamic;

pub use crate::engine::handle::Handle;
pub(crate) use crate::engine::task::{ExecuteError, Freshness, Node, Task, TaskNode};

/// Position of an upstream result: the graph it lives in and its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Input {
    pub(crate) graph: u64,
    pub(crate) index: NodeIndex,
}

/// An input that could not be resolved into the type its binding expects.
#[derive(Debug, Clone, Copy)]
pub struct Mismatch {
    pub position: usize,
    pub expected: &'static str,
}

/// Things that can be used as a dependency binding.
pub trait Binding: Copy + Send + Sync {
    type Output<'a>;

    fn input(&self) -> Input;
    fn expected(&self) -> &'static str;
    fn downcast<'a>(&self, output: &'a Dynamic) -> Option<Self::Output<'a>>;
}

/// A trait that enables a collection of [`Handle<T>`]s to be used as the
/// inputs of a node.
///
/// This trait is implemented for single handles, vectors of handles and tuples
/// of handles, allowing them to be passed to
/// [`TaskDef::depends_on`](crate::blueprint::TaskDef::depends_on). The
/// executor hands the node a slice of type-erased upstream results in the
/// same order as [`Dependencies::inputs`], and `resolve` turns them back
/// into references of the declared types.
pub trait Dependencies {
    /// The resulting type when all dependencies are resolved.
    /// For a tuple of [`Handle<T>`]s, this will be a tuple of `&'a T`s.
    type Output<'a>;

    /// Returns the upstream position of each dependency in the collection.
    fn inputs(&self) -> Vec<Input>;

    /// Takes a slice of type-erased upstream results and resolves them into a
    /// concrete `Output` type.
    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Result<Self::Output<'a>, Mismatch>;
}

fn resolve_one<'a, B: Binding>(
    binding: &B,
    outputs: &'a [Dynamic],
    position: usize,
) -> Result<B::Output<'a>, Mismatch> {
    let mismatch = Mismatch {
        position,
        expected: binding.expected(),
    };

    outputs
        .get(position)
        .and_then(|output| binding.downcast(output))
        .ok_or(mismatch)
}

impl Dependencies for () {
    type Output<'a> = ();

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn resolve<'a>(&self, _: &'a [Dynamic]) -> Result<Self::Output<'a>, Mismatch> {
        Ok(())
    }
}

impl<B> Dependencies for B
where
    B: Binding,
{
    type Output<'a> = B::Output<'a>;

    fn inputs(&self) -> Vec<Input> {
        vec![self.input()]
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Result<Self::Output<'a>, Mismatch> {
        resolve_one(self, outputs, 0)
    }
}

impl<B> Dependencies for Vec<B>
where
    B: Binding,
{
    type Output<'a> = Vec<B::Output<'a>>;

    fn inputs(&self) -> Vec<Input> {
        self.iter().map(Binding::input).collect()
    }

    fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Result<Self::Output<'a>, Mismatch> {
        self.iter()
            .enumerate()
            .map(|(position, binding)| resolve_one(binding, outputs, position))
            .collect()
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Binding),* {
            type Output<'a> = ($($D::Output<'a>,)*);

            fn inputs(&self) -> Vec<Input> {
                let ($($D,)*) = self;
                vec![$($D.input(),)*]
            }

            fn resolve<'a>(&self, outputs: &'a [Dynamic]) -> Result<Self::Output<'a>, Mismatch> {
                let ($($D,)*) = self;
                let mut position = 0;

                Ok(($({
                    let item = resolve_one($D, outputs, position)?;
                    position += 1;
                    item
                },)*))
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn dynamic<T: Send + Sync + 'static>(value: T) -> Dynamic {
        Arc::new(value)
    }

    #[test]
    fn test_tuple_resolves_in_order() {
        let deps = (
            Handle::<String>::new(7, NodeIndex::new(0)),
            Handle::<u32>::new(7, NodeIndex::new(1)),
        );
        let outputs = vec![dynamic(String::from("libfoo")), dynamic(3u32)];

        let (name, count) = deps.resolve(&outputs).unwrap();
        assert_eq!(name, "libfoo");
        assert_eq!(*count, 3);
        assert_eq!(deps.inputs().len(), 2);
    }

    #[test]
    fn test_tuple_reports_mismatched_position() {
        let deps = (
            Handle::<String>::new(7, NodeIndex::new(0)),
            Handle::<u32>::new(7, NodeIndex::new(1)),
        );
        let outputs = vec![dynamic(String::from("libfoo")), dynamic(String::from("x"))];

        let mismatch = deps.resolve(&outputs).unwrap_err();
        assert_eq!(mismatch.position, 1);
    }

    #[test]
    fn test_vec_resolves_all() {
        let deps: Vec<Handle<u32>> = (0..3)
            .map(|i| Handle::new(7, NodeIndex::new(i)))
            .collect();
        let outputs = vec![dynamic(1u32), dynamic(2u32), dynamic(3u32)];

        let resolved = deps.resolve(&outputs).unwrap();
        assert_eq!(resolved.into_iter().copied().sum::<u32>(), 6);
    }

    #[test]
    fn test_missing_output_is_a_mismatch() {
        let deps = Handle::<u32>::new(7, NodeIndex::new(0));
        assert!(deps.resolve(&[]).is_err());
    }
}
