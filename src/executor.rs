mod diagnostics;
mod journal;

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use camino::Utf8PathBuf;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;
use tracing::{debug, error, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{Blake3Hasher, Dynamic, Hash32};
use crate::engine::{ExecuteError, Freshness, Handle, Task};
use crate::error::{GraphError, JournalError, KasaneError};
use crate::utils::{as_overhead, get_style_run, get_style_task};
use crate::{Environment, TaskContext, TaskGraph};

pub use diagnostics::{NodeReport, NodeStatus, RunReport};
pub use journal::{Journal, Record};

/// Bumped whenever the fingerprint layout changes, so old journals are
/// invalidated instead of misread.
const FINGERPRINT_VERSION: &str = "kasane/fingerprint/1";

/// A shared flag that stops a run from starting any further node.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The result of one node that is available to its dependents.
#[derive(Clone)]
struct NodeState {
    output: Dynamic,
    fingerprint: Hash32,
    output_hash: Hash32,
}

enum Outcome {
    Reused(NodeState),
    Executed {
        settled: bool,
        state: NodeState,
        bytes: Vec<u8>,
    },
    Failed(anyhow::Error),
}

struct Finished {
    index: NodeIndex,
    fingerprint: Option<Hash32>,
    outcome: Outcome,
    start: Instant,
    duration: Duration,
}

/// The results of a finished run.
pub struct Run {
    graph: u64,
    outputs: HashMap<NodeIndex, Dynamic>,
    pub report: RunReport,
}

impl Run {
    /// The result a node produced or reused during this run. `None` when the
    /// node did not complete or the handle belongs to another graph.
    pub fn get<T: 'static>(&self, handle: &Handle<T>) -> Option<&T> {
        if handle.input.graph != self.graph {
            return None;
        }

        self.outputs.get(&handle.index())?.downcast_ref::<T>()
    }
}

/// Runs task graphs on a bounded worker pool, skipping every node whose
/// fingerprint matches the journal of previous runs.
pub struct IncrementalExecutor {
    journal: Journal,
    path: Option<Utf8PathBuf>,
    workers: usize,
    cancel: CancelToken,
}

impl IncrementalExecutor {
    /// An executor backed by the journal at `path`. Every committed node is
    /// written through to disk.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();

        Self {
            journal: Journal::load(&path),
            path: Some(path),
            ..Self::in_memory()
        }
    }

    /// An executor whose journal only lives as long as the value.
    pub fn in_memory() -> Self {
        Self {
            journal: Journal::default(),
            path: None,
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            cancel: CancelToken::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Executes `graph`. Nodes start as soon as all of their upstream nodes
    /// completed; a failed node blocks its dependents while independent
    /// nodes carry on. A failed critical node, or a cancellation, stops any
    /// further node from starting and waits for the running ones.
    ///
    /// Node failures are reported in the returned [`Run`]; only a failure to
    /// set up the pool or to persist the journal is an `Err`.
    pub fn run<G: Send + Sync>(
        &mut self,
        graph: &TaskGraph<G>,
        env: &Environment<G>,
    ) -> Result<Run, KasaneError> {
        let s = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("kasane-worker-{i}"))
            .build()?;

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut pending: HashMap<NodeIndex, usize> = graph
            .graph
            .node_indices()
            .map(|i| {
                let count = graph.graph.neighbors_directed(i, Direction::Incoming).count();
                (i, count)
            })
            .collect();

        let mut ready: VecDeque<NodeIndex> = graph
            .order
            .iter()
            .copied()
            .filter(|i| pending[i] == 0)
            .collect();

        let mut states: HashMap<NodeIndex, NodeState> = HashMap::new();
        let mut reports: HashMap<NodeIndex, NodeReport> = HashMap::new();
        let mut failures = Vec::new();
        let mut fatal = None;

        let root_span = tracing::info_span!("run");
        root_span.pb_set_length(graph.len() as u64);
        root_span.pb_set_style(&get_style_run());
        root_span.pb_set_message("Running tasks...");
        let _enter = root_span.enter();

        let task_style = get_style_task();
        let journal = &mut self.journal;
        let path = self.path.as_deref();
        let cancel = &self.cancel;

        // The coordinator stays on this thread; only node actions run on the
        // pool, so a single worker is enough to make progress.
        pool.in_place_scope(|scope| -> Result<(), KasaneError> {
            let (sender, receiver) = channel::<Finished>();
            let mut in_flight = 0usize;
            let mut halted = false;

            loop {
                if !halted && cancel.is_cancelled() {
                    warn!("Run cancelled, waiting for running tasks");
                    halted = true;
                }

                while !halted && let Some(index) = ready.pop_front() {
                    if reports.contains_key(&index) {
                        continue;
                    }

                    in_flight += 1;
                    let node = &graph.graph[index];

                    let prepared = fingerprint(graph, index, &states)
                        .zip(collect_inputs(graph, index, &states));

                    let Some((fingerprint, inputs)) = prepared else {
                        let error = anyhow!("an upstream result is missing");
                        let _ = sender.send(Finished::failed(index, error));
                        continue;
                    };

                    if node.freshness == Freshness::Fingerprint
                        && let Some(record) = journal.get(&node.key)
                        && record.settled
                        && record.fingerprint == fingerprint
                    {
                        match node.task.decode(&record.output) {
                            Ok(output) => {
                                debug!(node = %node.key, %fingerprint, "up to date");
                                let state = NodeState {
                                    output,
                                    fingerprint,
                                    output_hash: record.output_hash,
                                };
                                let _ = sender.send(Finished {
                                    index,
                                    fingerprint: Some(fingerprint),
                                    outcome: Outcome::Reused(state),
                                    start: Instant::now(),
                                    duration: Duration::ZERO,
                                });
                                continue;
                            }
                            Err(e) => {
                                debug!(node = %node.key, "previous result is unreadable: {e}")
                            }
                        }
                    }

                    let task = node.task.clone();
                    let key = node.key.clone();
                    let sender = sender.clone();
                    let style = task_style.clone();

                    scope.spawn(move |_| {
                        let span = tracing::info_span!("task", key = %key);
                        span.pb_set_style(&style);
                        span.pb_set_message("running");
                        let _enter = span.enter();

                        let context = TaskContext {
                            env,
                            key: &key,
                            span: span.clone(),
                        };

                        let start = Instant::now();
                        let outcome = execute(&*task, &context, &inputs, fingerprint);

                        let _ = sender.send(Finished {
                            index,
                            fingerprint: Some(fingerprint),
                            outcome,
                            start,
                            duration: start.elapsed(),
                        });
                    });
                }

                if in_flight == 0 {
                    break;
                }

                let Ok(finished) = receiver.recv() else {
                    break;
                };
                in_flight -= 1;
                root_span.pb_inc(1);

                let index = finished.index;
                let key = graph.key(index).to_string();
                let mut report = NodeReport {
                    key: key.clone(),
                    status: NodeStatus::Executed,
                    fingerprint: finished.fingerprint,
                    start: Some(finished.start),
                    duration: finished.duration,
                };

                let state = match finished.outcome {
                    Outcome::Reused(state) => {
                        report.status = NodeStatus::Skipped;
                        state
                    }
                    Outcome::Executed {
                        settled,
                        state,
                        bytes,
                    } => {
                        journal.commit(
                            &key,
                            Record {
                                fingerprint: state.fingerprint,
                                output_hash: state.output_hash,
                                output: bytes,
                                settled,
                            },
                        );

                        if let Some(path) = path {
                            journal.save(path)?;
                        }

                        if !settled {
                            info!(node = %key, "Finished with a partial result, it will run again next time");
                        }

                        debug!(node = %key, "done in {:.2?}", finished.duration);
                        state
                    }
                    Outcome::Failed(e) => {
                        let critical = graph.graph[index].critical;

                        if critical {
                            error!(node = %key, "{e:#}\nAborting the run.");
                            fatal = Some(key.clone());
                            halted = true;
                        } else {
                            error!(node = %key, "{e:#}\nContinuing with independent tasks.");
                        }

                        report.status = NodeStatus::Failed(format!("{e:#}"));
                        reports.insert(index, report);
                        failures.push((key.clone(), e));

                        let mut dfs = Dfs::new(&graph.graph, index);
                        while let Some(next) = dfs.next(&graph.graph) {
                            if next != index {
                                reports.entry(next).or_insert_with(|| NodeReport {
                                    key: graph.key(next).to_string(),
                                    status: NodeStatus::Blocked(key.clone()),
                                    fingerprint: None,
                                    start: None,
                                    duration: Duration::ZERO,
                                });
                            }
                        }

                        continue;
                    }
                };

                states.insert(index, state);
                reports.insert(index, report);

                for next in dependents.get(&index).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(next) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(*next);
                        }
                    }
                }
            }

            Ok(())
        })?;

        let nodes = graph
            .order
            .iter()
            .map(|index| {
                reports.remove(index).unwrap_or_else(|| NodeReport {
                    key: graph.key(*index).to_string(),
                    status: NodeStatus::Cancelled,
                    fingerprint: None,
                    start: None,
                    duration: Duration::ZERO,
                })
            })
            .collect();

        let report = RunReport {
            nodes,
            failures,
            fatal,
        };

        info!("{} {}", report.summary(), as_overhead(s));

        Ok(Run {
            graph: graph.id,
            outputs: states
                .into_iter()
                .map(|(index, state)| (index, state.output))
                .collect(),
            report,
        })
    }
}

impl Finished {
    fn failed(index: NodeIndex, error: anyhow::Error) -> Self {
        Self {
            index,
            fingerprint: None,
            outcome: Outcome::Failed(error),
            start: Instant::now(),
            duration: Duration::ZERO,
        }
    }
}

/// The digest of everything a node's result depends on: its key, its literal
/// parameters and the key, fingerprint and result hash of every upstream
/// node in a fixed order. `None` while an upstream node has no result.
fn fingerprint<G: Send + Sync>(
    graph: &TaskGraph<G>,
    index: NodeIndex,
    states: &HashMap<NodeIndex, NodeState>,
) -> Option<Hash32> {
    let node = &graph.graph[index];

    let mut hasher = Blake3Hasher::default();
    hasher
        .update_str(FINGERPRINT_VERSION)
        .update_str(&node.key)
        .update(node.params.as_bytes());

    for upstream in graph.upstream_of(index) {
        let state = states.get(&upstream)?;
        hasher
            .update_str(graph.key(upstream))
            .update(state.fingerprint.as_bytes())
            .update(state.output_hash.as_bytes());
    }

    Some(hasher.into())
}

fn collect_inputs<G: Send + Sync>(
    graph: &TaskGraph<G>,
    index: NodeIndex,
    states: &HashMap<NodeIndex, NodeState>,
) -> Option<Vec<Dynamic>> {
    graph.graph[index]
        .task
        .inputs()
        .iter()
        .map(|input| states.get(&input.index).map(|state| state.output.clone()))
        .collect()
}

fn execute<G: Send + Sync>(
    task: &dyn Task<G>,
    context: &TaskContext<G>,
    inputs: &[Dynamic],
    fingerprint: Hash32,
) -> Outcome {
    // The action only sees shared references to upstream results, so a
    // panic cannot leave any state behind that other tasks observe.
    let output = match catch_unwind(AssertUnwindSafe(|| task.execute(context, inputs))) {
        Ok(Ok(output)) => output,
        Ok(Err(ExecuteError::Action(e))) => return Outcome::Failed(e),
        Ok(Err(ExecuteError::Input(mismatch))) => {
            return Outcome::Failed(
                GraphError::WrongType {
                    node: context.key.to_string(),
                    input: mismatch.position,
                    expected: mismatch.expected,
                }
                .into(),
            );
        }
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            return Outcome::Failed(anyhow!(message));
        }
    };

    match task.encode(&output) {
        Ok(bytes) => Outcome::Executed {
            settled: task.is_settled(&output),
            state: NodeState {
                output_hash: Hash32::hash(&bytes),
                output,
                fingerprint,
            },
            bytes,
        },
        Err(message) => Outcome::Failed(
            JournalError::Encode {
                node: context.key.to_string(),
                message,
            }
            .into(),
        ),
    }
}
