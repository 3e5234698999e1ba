use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::TaskContext;
use crate::core::{Blake3Hasher, Hash32};
use crate::engine::{Dependencies, Freshness, Handle, Input, Node, Task, TaskNode};
use crate::error::GraphError;

static NEXT_GRAPH: AtomicU64 = AtomicU64::new(1);

/// The blueprint of a task graph.
///
/// `Blueprint` is used to define the nodes of one phase of a run. You add
/// nodes under stable string keys and wire them together using their
/// [`Handle`]s. Literal parameters a node captures are declared with
/// [`TaskDef::params`] so they take part in the node's fingerprint.
///
/// Once configured, [`Blueprint::finish`] validates the wiring and produces
/// an immutable [`TaskGraph`].
///
/// # Example
///
/// ```rust
/// use kasane::Blueprint;
///
/// let mut blueprint: Blueprint<()> = Blueprint::new();
/// let version = blueprint.task("version").run(|_| Ok(String::from("1.3.0")));
/// blueprint
///     .task("banner")
///     .depends_on(version)
///     .run(|_, version| Ok(format!("release {version}")));
///
/// let graph = blueprint.finish().unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
pub struct Blueprint<G: Send + Sync = ()> {
    id: u64,
    graph: Graph<Node<G>, ()>,
    keys: HashMap<String, NodeIndex>,
    errors: Vec<GraphError>,
}

impl<G: Send + Sync + 'static> Blueprint<G> {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH.fetch_add(1, Ordering::Relaxed),
            graph: Graph::new(),
            keys: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// The entry point for defining a node under a stable key.
    pub fn task(&mut self, key: impl Into<String>) -> TaskDef<'_, G> {
        TaskDef {
            blueprint: self,
            key: key.into(),
            params: Blake3Hasher::default(),
            freshness: Freshness::Fingerprint,
            critical: false,
        }
    }

    /// Orders `after` behind `before` without passing any data between them.
    pub fn order_after<A, B>(&mut self, before: Handle<A>, after: Handle<B>) {
        let key = match self.graph.node_weight(after.index()) {
            Some(node) if after.input.graph == self.id => node.key.clone(),
            _ => {
                self.errors.push(GraphError::Wiring {
                    node: format!("#{}", after.index().index()),
                    input: 0,
                });
                return;
            }
        };

        if self.contains(before.input) {
            self.graph.add_edge(before.index(), after.index(), ());
        } else {
            self.errors.push(GraphError::Wiring {
                node: key,
                input: 0,
            });
        }
    }

    /// Number of nodes defined so far.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Validates the wiring and freezes the graph.
    pub fn finish(mut self) -> Result<TaskGraph<G>, GraphError> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }

        let order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|cycle| GraphError::Cycle(self.graph[cycle.node_id()].key.clone()))?;

        Ok(TaskGraph {
            id: self.id,
            graph: self.graph,
            keys: self.keys,
            order,
        })
    }

    fn contains(&self, input: Input) -> bool {
        input.graph == self.id && input.index.index() < self.graph.node_count()
    }

    fn add_node<O>(
        &mut self,
        key: String,
        params: Hash32,
        freshness: Freshness,
        critical: bool,
        task: Arc<dyn Task<G>>,
    ) -> Handle<O> {
        if self.keys.contains_key(&key) {
            self.errors.push(GraphError::DuplicateKey(key.clone()));
        }

        let inputs = task.inputs();
        let index = self.graph.add_node(Node {
            key: key.clone(),
            params,
            freshness,
            critical,
            task,
        });

        for (position, input) in inputs.into_iter().enumerate() {
            if input.index != index && self.contains(input) {
                self.graph.add_edge(input.index, index, ());
            } else {
                self.errors.push(GraphError::Wiring {
                    node: key.clone(),
                    input: position,
                });
            }
        }

        self.keys.entry(key).or_insert(index);
        Handle::new(self.id, index)
    }
}

impl<G: Send + Sync + 'static> Default for Blueprint<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// A node under construction, before its dependencies are declared.
pub struct TaskDef<'a, G: Send + Sync> {
    blueprint: &'a mut Blueprint<G>,
    key: String,
    params: Blake3Hasher,
    freshness: Freshness,
    critical: bool,
}

impl<'a, G: Send + Sync + 'static> TaskDef<'a, G> {
    /// Declares a literal parameter of the node. Changing any parameter
    /// changes the node's fingerprint.
    pub fn params<P: Hash + ?Sized>(mut self, value: &P) -> Self {
        value.hash(&mut self.params);
        self
    }

    /// The node is executed on every run, regardless of its fingerprint.
    pub fn always(mut self) -> Self {
        self.freshness = Freshness::Always;
        self
    }

    /// A failure of this node cancels every node that has not started yet.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn depends_on<D>(self, dependencies: D) -> TaskBinder<'a, G, D>
    where
        D: Dependencies,
    {
        TaskBinder {
            def: self,
            dependencies,
        }
    }

    pub fn run<F, R>(self, callback: F) -> Handle<R>
    where
        F: Fn(&TaskContext<'_, G>) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Send + Sync + Serialize + DeserializeOwned + Hash + 'static,
    {
        self.depends_on(()).run(move |ctx, ()| callback(ctx))
    }
}

/// A node whose dependencies are known, waiting for its action.
pub struct TaskBinder<'a, G: Send + Sync, D> {
    def: TaskDef<'a, G>,
    dependencies: D,
}

impl<'a, G, D> TaskBinder<'a, G, D>
where
    G: Send + Sync + 'static,
    D: Dependencies + Send + Sync + 'static,
{
    pub fn run<F, R>(self, callback: F) -> Handle<R>
    where
        F: for<'b> Fn(&TaskContext<'b, G>, D::Output<'b>) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
        R: Send + Sync + Serialize + DeserializeOwned + Hash + 'static,
    {
        self.register(callback, None)
    }

    /// Like [`run`](Self::run), but results matching `retry_when` are handed
    /// downstream without being reused by the next run.
    pub fn run_retrying<F, R, P>(self, callback: F, retry_when: P) -> Handle<R>
    where
        F: for<'b> Fn(&TaskContext<'b, G>, D::Output<'b>) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
        R: Send + Sync + Serialize + DeserializeOwned + Hash + 'static,
        P: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.register(callback, Some(Box::new(move |output: &R| !retry_when(output))))
    }

    #[allow(clippy::type_complexity)]
    fn register<F, R>(
        self,
        callback: F,
        settled: Option<Box<dyn Fn(&R) -> bool + Send + Sync>>,
    ) -> Handle<R>
    where
        F: for<'b> Fn(&TaskContext<'b, G>, D::Output<'b>) -> anyhow::Result<R>
            + Send
            + Sync
            + 'static,
        R: Send + Sync + Serialize + DeserializeOwned + Hash + 'static,
    {
        let TaskDef {
            blueprint,
            key,
            params,
            freshness,
            critical,
        } = self.def;

        let task = TaskNode {
            dependencies: self.dependencies,
            callback,
            settled,
            _phantom: PhantomData,
        };

        blueprint.add_node(key, params.into(), freshness, critical, Arc::new(task))
    }
}

/// An immutable, validated task graph.
pub struct TaskGraph<G: Send + Sync = ()> {
    pub(crate) id: u64,
    pub(crate) graph: Graph<Node<G>, ()>,
    keys: HashMap<String, NodeIndex>,
    /// A topological order, used for diagnostics and deterministic seeding.
    pub(crate) order: Vec<NodeIndex>,
}

impl<G: Send + Sync> TaskGraph<G> {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Node keys in topological order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&index| self.graph[index].key.as_str())
    }

    /// Keys of the nodes `key` directly depends on, in input order.
    pub fn upstream(&self, key: &str) -> Vec<&str> {
        let Some(&index) = self.keys.get(key) else {
            return vec![];
        };

        self.upstream_of(index)
            .into_iter()
            .map(|index| self.graph[index].key.as_str())
            .collect()
    }

    pub(crate) fn key(&self, index: NodeIndex) -> &str {
        &self.graph[index].key
    }

    /// Upstream nodes of `index`: declared inputs first, then ordering-only
    /// predecessors.
    pub(crate) fn upstream_of(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut upstream: Vec<NodeIndex> = self.graph[index]
            .task
            .inputs()
            .into_iter()
            .map(|input| input.index)
            .collect();

        let mut ordering: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
            .filter(|dep| !upstream.contains(dep))
            .collect();
        ordering.sort();
        ordering.dedup();

        upstream.extend(ordering);
        upstream
    }
}

impl<G: Send + Sync> std::fmt::Display for TaskGraph<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for &index in &self.order {
            let name = self.graph[index].key.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.raw_edges() {
            let source = &self.graph[edge.source()];
            let type_name = source
                .task
                .output_type_name()
                .rsplit("::")
                .next()
                .unwrap_or_default()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                type_name,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
