use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calltree_runtime::{NodeReport, TreeReport};

use crate::error::Error;

/// Read one run file.
pub fn load_run(path: &Path) -> Result<TreeReport, Error> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::RunReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|e| Error::InvalidRunData {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Sort key of a run file name: `<timestamp_ms>.json` or `<timestamp_ms>_<n>.json`.
fn run_file_key(path: &Path) -> Option<(u64, u32)> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    match stem.split_once('_') {
        Some((ts, n)) => Some((ts.parse().ok()?, n.parse().ok()?)),
        None => Some((stem.parse().ok()?, 0)),
    }
}

fn run_files(runs_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = std::fs::read_dir(runs_dir).map_err(|source| Error::RunReadError {
        path: runs_dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            run_file_key(&path).map(|_| path)
        })
        .collect();
    files.sort_by_key(|p| run_file_key(p));
    Ok(files)
}

/// The most recent run file in `runs_dir`, by the timestamp in its name.
pub fn find_latest_run_file(runs_dir: &Path) -> Result<PathBuf, Error> {
    run_files(runs_dir)?
        .pop()
        .ok_or_else(|| Error::NoRuns(runs_dir.to_path_buf()))
}

/// Load every file of run `run_id` and merge the threads into one tree.
pub fn load_run_by_id(runs_dir: &Path, run_id: &str) -> Result<Option<TreeReport>, Error> {
    let mut merged: Option<TreeReport> = None;
    for path in run_files(runs_dir)? {
        let run = match load_run(&path) {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(%err, "skipping unreadable run file");
                continue;
            }
        };
        if run.run_id != run_id {
            continue;
        }
        match merged.as_mut() {
            Some(acc) => acc.merge(&run),
            None => merged = Some(run),
        }
    }
    Ok(merged)
}

/// Load the latest run, merged across all of its threads.
pub fn load_latest_run(runs_dir: &Path) -> Result<TreeReport, Error> {
    let latest = find_latest_run_file(runs_dir)?;
    let run = load_run(&latest)?;
    Ok(load_run_by_id(runs_dir, &run.run_id)?.unwrap_or(run))
}

/// Options for the indented tree view.
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    /// Deepest level shown; top-level scopes are depth 1.
    pub max_depth: Option<usize>,
    /// Hide scopes below this share of their parent.
    pub min_percent: f64,
    /// Show raw cycle counts instead of milliseconds.
    pub cycles: bool,
}

struct Units {
    ns_per_cycle: f64,
    cycles: bool,
}

impl Units {
    fn of(run: &TreeReport, cycles: bool) -> Self {
        Self {
            ns_per_cycle: run.ns_per_cycle,
            cycles,
        }
    }

    fn fmt(&self, value: u64) -> String {
        if self.cycles {
            value.to_string()
        } else {
            format!("{:.3}ms", value as f64 * self.ns_per_cycle / 1_000_000.0)
        }
    }

    fn fmt_min(&self, value: u64, has_sample: bool) -> String {
        if has_sample {
            self.fmt(value)
        } else {
            "-".to_string()
        }
    }

    fn fmt_delta(&self, delta: i128) -> String {
        if self.cycles {
            format!("{delta:+}")
        } else {
            format!("{:+.3}ms", delta as f64 * self.ns_per_cycle / 1_000_000.0)
        }
    }
}

const TREE_HEADER_WIDTH: usize = 104;

/// Render a run as an indented tree, children in discovery order.
pub fn format_tree(run: &TreeReport, opts: &TreeOptions) -> String {
    let units = Units::of(run, opts.cycles);
    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>7} {:>12} {:>12} {:>12} {:>12} {:>6}\n",
        "Scope", "Calls", "Total", "Avg", "Max", "Min", "%Par"
    ));
    out.push_str(&format!("{}\n", "-".repeat(TREE_HEADER_WIDTH)));

    fn rows(node: &NodeReport, depth: usize, opts: &TreeOptions, units: &Units, out: &mut String) {
        if opts.max_depth.is_some_and(|max| depth > max) {
            return;
        }
        if node.percent_of_parent < opts.min_percent {
            return;
        }
        let label = format!("{}{}", "  ".repeat(depth - 1), node.id);
        out.push_str(&format!(
            "{:<40} {:>7} {:>12} {:>12} {:>12} {:>12} {:>5.1}%\n",
            label,
            node.calls,
            units.fmt(node.total_cycles),
            units.fmt(node.avg_cycles),
            units.fmt(node.max_cycles),
            units.fmt_min(node.min_cycles, node.has_sample()),
            node.percent_of_parent,
        ));
        for child in &node.children {
            rows(child, depth + 1, opts, units, out);
        }
    }

    for child in &run.root.children {
        rows(child, 1, opts, &units, &mut out);
    }
    out
}

/// Statistics for one identifier summed over every place it appears.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    pub id: String,
    pub calls: u64,
    pub total_cycles: u64,
    pub max_cycles: u64,
    pub min_cycles: u64,
}

/// Aggregate the tree by identifier, sorted by total cycles descending.
///
/// Calls are counted everywhere an identifier appears, but a node nested
/// under an ancestor with the same identifier (A -> B -> A) adds no total:
/// its time is already inside the outer node's.
pub fn flatten(run: &TreeReport) -> Vec<FlatEntry> {
    fn visit<'a>(
        node: &'a NodeReport,
        ancestors: &mut Vec<&'a str>,
        order: &mut Vec<&'a str>,
        map: &mut HashMap<&'a str, FlatEntry>,
    ) {
        let id = node.id.as_str();
        let entry = map.entry(id).or_insert_with(|| {
            order.push(id);
            FlatEntry {
                id: node.id.clone(),
                calls: 0,
                total_cycles: 0,
                max_cycles: 0,
                min_cycles: u64::MAX,
            }
        });
        entry.calls += u64::from(node.calls);
        if !ancestors.contains(&id) {
            entry.total_cycles = entry.total_cycles.saturating_add(node.total_cycles);
        }
        entry.max_cycles = entry.max_cycles.max(node.max_cycles);
        entry.min_cycles = entry.min_cycles.min(node.min_cycles);

        ancestors.push(id);
        for child in &node.children {
            visit(child, ancestors, order, map);
        }
        ancestors.pop();
    }

    let mut order: Vec<&str> = Vec::new();
    let mut map: HashMap<&str, FlatEntry> = HashMap::new();
    let mut ancestors: Vec<&str> = Vec::new();
    for child in &run.root.children {
        visit(child, &mut ancestors, &mut order, &mut map);
    }
    let mut result: Vec<FlatEntry> = order
        .into_iter()
        .filter_map(|id| map.remove(id))
        .collect();
    // Stable sort keeps discovery order among equal totals.
    result.sort_by(|a, b| b.total_cycles.cmp(&a.total_cycles));
    result
}

pub fn format_flat(run: &TreeReport, cycles: bool) -> String {
    let units = Units::of(run, cycles);
    let mut out = String::new();
    out.push_str(&format!(
        "{:<40} {:>7} {:>12} {:>12} {:>12}\n",
        "Scope", "Calls", "Total", "Max", "Min"
    ));
    out.push_str(&format!("{}\n", "-".repeat(86)));
    for e in flatten(run) {
        out.push_str(&format!(
            "{:<40} {:>7} {:>12} {:>12} {:>12}\n",
            e.id,
            e.calls,
            units.fmt(e.total_cycles),
            units.fmt(e.max_cycles),
            units.fmt_min(e.min_cycles, e.min_cycles <= e.max_cycles),
        ));
    }
    out
}

/// `parent/child` path of every scope below the root, with its total.
fn path_totals(run: &TreeReport) -> Vec<(String, u64)> {
    fn go(node: &NodeReport, prefix: &str, out: &mut Vec<(String, u64)>) {
        let path = if prefix.is_empty() {
            node.id.clone()
        } else {
            format!("{prefix}/{}", node.id)
        };
        out.push((path.clone(), node.total_cycles));
        for child in &node.children {
            go(child, &path, out);
        }
    }
    let mut out = Vec::new();
    for child in &run.root.children {
        go(child, "", &mut out);
    }
    out
}

/// Show the delta of total time between two runs, matching scopes by path.
pub fn diff_runs(a: &TreeReport, b: &TreeReport, cycles: bool) -> String {
    let units = Units::of(b, cycles);
    let before_units = Units::of(a, cycles);
    let a_totals = path_totals(a);
    let b_totals = path_totals(b);
    let a_map: HashMap<&str, u64> = a_totals.iter().map(|(p, t)| (p.as_str(), *t)).collect();
    let b_map: HashMap<&str, u64> = b_totals.iter().map(|(p, t)| (p.as_str(), *t)).collect();

    let mut paths: Vec<&str> = a_map.keys().chain(b_map.keys()).copied().collect();
    paths.sort_unstable();
    paths.dedup();

    let mut out = String::new();
    out.push_str(&format!(
        "{:<48} {:>12} {:>12} {:>13}\n",
        "Scope", "Before", "After", "Delta"
    ));
    out.push_str(&format!("{}\n", "-".repeat(88)));
    for path in paths {
        let before = a_map.get(path).copied().unwrap_or(0);
        let after = b_map.get(path).copied().unwrap_or(0);
        let delta = if cycles {
            after as i128 - before as i128
        } else {
            // Runs may have different calibrations; compare in wall time.
            let ns = after as f64 * units.ns_per_cycle - before as f64 * before_units.ns_per_cycle;
            (ns / units.ns_per_cycle.max(f64::MIN_POSITIVE)) as i128
        };
        out.push_str(&format!(
            "{:<48} {:>12} {:>12} {:>13}\n",
            path,
            before_units.fmt(before),
            units.fmt(after),
            units.fmt_delta(delta),
        ));
    }
    out
}

fn validate_tag(name: &str) -> Result<(), Error> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidTagName(name.to_string()))
    }
}

/// Record `run_id` under tag `name`.
pub fn save_tag(tags_dir: &Path, name: &str, run_id: &str) -> Result<(), Error> {
    validate_tag(name)?;
    std::fs::create_dir_all(tags_dir)?;
    std::fs::write(tags_dir.join(name), run_id)?;
    Ok(())
}

/// The run id stored under tag `name`.
pub fn resolve_tag(tags_dir: &Path, name: &str) -> Result<String, Error> {
    validate_tag(name)?;
    match std::fs::read_to_string(tags_dir.join(name)) {
        Ok(id) => Ok(id.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::RunNotFound {
            tag: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Load the run a tag points at, merged across threads.
pub fn load_tagged_run(tags_dir: &Path, runs_dir: &Path, tag: &str) -> Result<TreeReport, Error> {
    let run_id = resolve_tag(tags_dir, tag)?;
    load_run_by_id(runs_dir, &run_id)?.ok_or_else(|| Error::RunNotFound {
        tag: tag.to_string(),
    })
}
