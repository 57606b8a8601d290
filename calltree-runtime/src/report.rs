//! Serializable snapshot of a call tree, the shape reporters consume.
//!
//! Built only through the tree's read API. Percentages and averages are
//! derived here, never stored in the tree. Reports from several threads can
//! be merged by identifier path once those threads are quiescent.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::tree::{percent_of, NodeRef, ProfileTree};
use crate::tsc;

/// One node of an exported tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: String,
    pub calls: u32,
    pub total_cycles: u64,
    pub avg_cycles: u64,
    pub max_cycles: u64,
    /// `u64::MAX` until a call has completed.
    pub min_cycles: u64,
    pub percent_of_parent: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeReport>,
}

impl NodeReport {
    /// Snapshot `node` and everything below it.
    pub fn from_node(node: NodeRef<'_>) -> Self {
        let stats = node.stats();
        Self {
            id: node.id().to_owned(),
            calls: stats.call_count,
            total_cycles: stats.total_cycles,
            avg_cycles: stats.average_cycles(),
            max_cycles: stats.max_cycles,
            min_cycles: stats.min_cycles,
            percent_of_parent: node.percent_of_parent(),
            children: node.children().map(NodeReport::from_node).collect(),
        }
    }

    /// True once at least one call has completed.
    pub fn has_sample(&self) -> bool {
        self.min_cycles <= self.max_cycles
    }

    /// Follow child identifiers from this node.
    pub fn find(&self, path: &[&str]) -> Option<&NodeReport> {
        let mut node = self;
        for id in path {
            node = node.children.iter().find(|c| c.id == *id)?;
        }
        Some(node)
    }

    /// Depth-first visit with each node's depth below `self`.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a NodeReport, usize)) {
        fn go<'a>(node: &'a NodeReport, depth: usize, f: &mut impl FnMut(&'a NodeReport, usize)) {
            f(node, depth);
            for child in &node.children {
                go(child, depth + 1, f);
            }
        }
        go(self, 0, f);
    }

    fn merge(&mut self, other: &NodeReport) {
        self.calls = self.calls.saturating_add(other.calls);
        self.total_cycles = self.total_cycles.saturating_add(other.total_cycles);
        self.max_cycles = self.max_cycles.max(other.max_cycles);
        self.min_cycles = self.min_cycles.min(other.min_cycles);
        for theirs in &other.children {
            match self.children.iter_mut().find(|c| c.id == theirs.id) {
                Some(ours) => ours.merge(theirs),
                None => self.children.push(theirs.clone()),
            }
        }
    }

    fn refresh_derived(&mut self, parent_total: Option<u64>) {
        self.avg_cycles = if self.calls == 0 {
            0
        } else {
            self.total_cycles / u64::from(self.calls)
        };
        self.percent_of_parent = percent_of(self.total_cycles, parent_total.unwrap_or(0));
        let total = self.total_cycles;
        for child in &mut self.children {
            child.refresh_derived(Some(total));
        }
    }
}

/// A whole exported run: metadata plus the tree from the root down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeReport {
    pub run_id: String,
    pub timestamp_ms: u64,
    pub thread: String,
    /// Converts the cycle figures to wall time.
    pub ns_per_cycle: f64,
    pub root: NodeReport,
}

impl TreeReport {
    pub fn from_tree(tree: &ProfileTree) -> Self {
        Self {
            run_id: run_id().to_owned(),
            timestamp_ms: timestamp_ms(),
            thread: thread_label(),
            ns_per_cycle: tsc::ns_per_cycle(),
            root: NodeReport::from_node(tree.root()),
        }
    }

    /// Fold another thread's report into this one by identifier path.
    pub fn merge(&mut self, other: &TreeReport) {
        self.root.merge(&other.root);
        self.root.refresh_derived(None);
        if !other.thread.is_empty() && other.thread != self.thread {
            self.thread = format!("{},{}", self.thread, other.thread);
        }
        self.timestamp_ms = self.timestamp_ms.max(other.timestamp_ms);
    }

    pub fn find(&self, path: &[&str]) -> Option<&NodeReport> {
        self.root.find(path)
    }

    pub fn cycles_to_ms(&self, cycles: u64) -> f64 {
        cycles as f64 * self.ns_per_cycle / 1_000_000.0
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.write_json_to(File::create(path)?)
    }

    /// Write as pretty JSON to an already opened sink.
    pub fn write_json_to(&self, sink: impl Write) -> std::io::Result<()> {
        let mut w = BufWriter::new(sink);
        serde_json::to_writer_pretty(&mut w, self)?;
        writeln!(w)?;
        w.flush()
    }
}

/// Process-wide run identifier shared by every thread's export.
fn run_id() -> &'static str {
    static RUN_ID: OnceLock<String> = OnceLock::new();
    RUN_ID.get_or_init(|| format!("{}_{}", std::process::id(), timestamp_ms()))
}

pub(crate) fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_owned(),
        None => format!("{:?}", current.id()),
    }
}
