use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::TaskGraph;
use crate::core::Hash32;

/// What happened to a node during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    /// The action ran and its result was committed.
    Executed,
    /// The fingerprint matched; the previous result was reused verbatim.
    Skipped,
    /// The action failed with the given message.
    Failed(String),
    /// An upstream node (the given key) failed, so this node never ran.
    Blocked(String),
    /// The run was aborted before this node started.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub key: String,
    pub status: NodeStatus,
    pub fingerprint: Option<Hash32>,
    pub start: Option<Instant>,
    pub duration: Duration,
}

/// Outcome of one executor run.
///
/// Node reports are listed in topological order. The original errors of
/// failed nodes are kept in `failures` so callers can downcast them to the
/// typed errors of the gateways.
#[derive(Debug, Default)]
pub struct RunReport {
    pub nodes: Vec<NodeReport>,
    pub failures: Vec<(String, anyhow::Error)>,
    /// Key of the critical node whose failure aborted the run.
    pub fatal: Option<String>,
}

impl RunReport {
    pub fn status(&self, key: &str) -> Option<&NodeStatus> {
        self.nodes
            .iter()
            .find(|node| node.key == key)
            .map(|node| &node.status)
    }

    pub fn fingerprint(&self, key: &str) -> Option<Hash32> {
        self.nodes
            .iter()
            .find(|node| node.key == key)
            .and_then(|node| node.fingerprint)
    }

    fn keys_where(&self, predicate: impl Fn(&NodeStatus) -> bool) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| predicate(&node.status))
            .map(|node| node.key.as_str())
            .collect()
    }

    pub fn executed(&self) -> Vec<&str> {
        self.keys_where(|status| *status == NodeStatus::Executed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.keys_where(|status| *status == NodeStatus::Skipped)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.keys_where(|status| matches!(status, NodeStatus::Failed(_)))
    }

    pub fn blocked(&self) -> Vec<&str> {
        self.keys_where(|status| matches!(status, NodeStatus::Blocked(_)))
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.keys_where(|status| *status == NodeStatus::Cancelled)
    }

    /// Every node either ran or was skipped.
    pub fn is_success(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| matches!(node.status, NodeStatus::Executed | NodeStatus::Skipped))
    }

    pub fn summary(&self) -> String {
        format!(
            "{} executed, {} up to date, {} failed, {} blocked, {} cancelled",
            self.executed().len(),
            self.skipped().len(),
            self.failed().len(),
            self.blocked().len(),
            self.cancelled().len(),
        )
    }

    /// Renders the task graph as a Mermaid diagram, colour-coded by status.
    ///
    /// * **Green**: Executed
    /// * **Blue**: Up to date (skipped)
    /// * **Red**: Failed
    /// * **Grey**: Blocked or cancelled
    pub fn render_mermaid<G: Send + Sync>(&self, graph: &TaskGraph<G>) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (i, key) in graph.keys().enumerate() {
            let name = key.replace('"', "\\\"");
            let (label, colour) = match self.status(key) {
                Some(NodeStatus::Executed) => {
                    let duration = self
                        .nodes
                        .iter()
                        .find(|node| node.key == key)
                        .map(|node| node.duration)
                        .unwrap_or_default();
                    (format!("{duration:.2?}"), "#86efac")
                }
                Some(NodeStatus::Skipped) => ("up to date".to_string(), "#93c5fd"),
                Some(NodeStatus::Failed(_)) => ("failed".to_string(), "#fca5a5"),
                Some(NodeStatus::Blocked(_)) => ("blocked".to_string(), "#d1d5db"),
                Some(NodeStatus::Cancelled) | None => ("cancelled".to_string(), "#d1d5db"),
            };

            let _ = writeln!(f, "    n{i}[\"{name}<br/>{label}\"]");
            let _ = writeln!(f, "    style n{i} fill:{colour}");
        }

        let position = |key: &str| graph.keys().position(|k| k == key);
        for key in graph.keys() {
            for upstream in graph.upstream(key) {
                if let (Some(from), Some(to)) = (position(upstream), position(key)) {
                    let _ = writeln!(f, "    n{from} --> n{to}");
                }
            }
        }

        f
    }
}
