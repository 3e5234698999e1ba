use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::TaskContext;
use crate::core::{Dynamic, Hash32};
use crate::engine::{Dependencies, Input, Mismatch};

/// When a node's previous result may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Freshness {
    /// Reuse the previous result while the fingerprint matches.
    #[default]
    Fingerprint,
    /// Always execute; the node observes state outside the graph.
    Always,
}

/// A node of the task graph: the stable identity plus the action.
pub(crate) struct Node<G> {
    pub key: String,
    /// Digest of the literal parameters captured by the action.
    pub params: Hash32,
    pub freshness: Freshness,
    /// A failure of this node cancels every node that has not started yet.
    pub critical: bool,
    pub task: Arc<dyn Task<G>>,
}

impl<G> Clone for Node<G> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            params: self.params,
            freshness: self.freshness,
            critical: self.critical,
            task: self.task.clone(),
        }
    }
}

/// A failure while executing a node, before or inside its action.
pub(crate) enum ExecuteError {
    Input(Mismatch),
    Action(anyhow::Error),
}

pub(crate) trait TypedTask<G: Send + Sync = ()>: Send + Sync {
    /// The concrete output type of this task.
    type Output: Send + Sync + Serialize + DeserializeOwned + Hash + 'static;

    fn inputs(&self) -> Vec<Input>;

    fn execute(
        &self,
        context: &TaskContext<G>,
        inputs: &[Dynamic],
    ) -> Result<Self::Output, ExecuteError>;

    /// Whether a result may be reused by the next run.
    fn is_settled(&self, _: &Self::Output) -> bool {
        true
    }
}

/// The type-erased foundation that allows the graph to hold tasks with
/// different output types.
pub(crate) trait Task<G: Send + Sync = ()>: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    fn inputs(&self) -> Vec<Input>;

    fn execute(&self, context: &TaskContext<G>, inputs: &[Dynamic])
    -> Result<Dynamic, ExecuteError>;

    fn encode(&self, output: &Dynamic) -> Result<Vec<u8>, String>;

    fn decode(&self, bytes: &[u8]) -> Result<Dynamic, String>;

    fn is_settled(&self, output: &Dynamic) -> bool;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<G, T> Task<G> for T
where
    G: Send + Sync,
    T: TypedTask<G> + 'static,
{
    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<T::Output>()
    }

    fn inputs(&self) -> Vec<Input> {
        T::inputs(self)
    }

    fn execute(
        &self,
        context: &TaskContext<G>,
        inputs: &[Dynamic],
    ) -> Result<Dynamic, ExecuteError> {
        let output = T::execute(self, context, inputs)?;
        Ok(Arc::new(output))
    }

    fn encode(&self, output: &Dynamic) -> Result<Vec<u8>, String> {
        let output = output
            .downcast_ref::<T::Output>()
            .ok_or_else(|| format!("expected {}", self.output_type_name()))?;

        let mut buffer = Vec::new();
        ciborium::into_writer(output, &mut buffer).map_err(|e| e.to_string())?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Dynamic, String> {
        let output: T::Output = ciborium::from_reader(bytes).map_err(|e| e.to_string())?;
        Ok(Arc::new(output))
    }

    fn is_settled(&self, output: &Dynamic) -> bool {
        output
            .downcast_ref::<T::Output>()
            .is_some_and(|output| T::is_settled(self, output))
    }
}

type Settle<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

/// A node action built from a callback and its typed dependencies.
pub(crate) struct TaskNode<G, R, D, F>
where
    G: Send + Sync,
    R: Send + Sync + 'static,
    D: Dependencies,
    F: for<'a> Fn(&TaskContext<'a, G>, D::Output<'a>) -> anyhow::Result<R> + Send + Sync,
{
    pub dependencies: D,
    pub callback: F,
    pub settled: Option<Settle<R>>,
    pub _phantom: PhantomData<fn(&G)>,
}

impl<G, R, D, F> TypedTask<G> for TaskNode<G, R, D, F>
where
    G: Send + Sync + 'static,
    R: Send + Sync + Serialize + DeserializeOwned + Hash + 'static,
    D: Dependencies + Send + Sync,
    F: for<'a> Fn(&TaskContext<'a, G>, D::Output<'a>) -> anyhow::Result<R> + Send + Sync + 'static,
{
    type Output = R;

    fn inputs(&self) -> Vec<Input> {
        self.dependencies.inputs()
    }

    fn execute(&self, context: &TaskContext<G>, inputs: &[Dynamic]) -> Result<R, ExecuteError> {
        let inputs = self
            .dependencies
            .resolve(inputs)
            .map_err(ExecuteError::Input)?;

        (self.callback)(context, inputs).map_err(ExecuteError::Action)
    }

    fn is_settled(&self, output: &R) -> bool {
        self.settled.as_ref().is_none_or(|settled| settled(output))
    }
}
