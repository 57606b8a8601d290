use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use calltree::error::Error;
use calltree::report::{
    diff_runs, format_flat, format_tree, load_latest_run, load_run, load_run_by_id,
    load_tagged_run, save_tag, TreeOptions,
};
use calltree_runtime::TreeReport;

#[derive(Parser)]
#[command(
    name = "calltree",
    about = "Render hierarchical call-tree profiles written by calltree-runtime",
    version,
    after_help = "Profiled programs write runs with calltree_runtime::flush()."
)]
struct Cli {
    /// Directory holding run files.
    #[arg(long, global = true, env = "CALLTREE_RUNS_DIR", value_name = "DIR")]
    runs_dir: Option<PathBuf>,

    /// Directory holding tags.
    #[arg(long, global = true, env = "CALLTREE_TAGS_DIR", value_name = "DIR")]
    tags_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the latest run (or a specific file or tag) as a call tree.
    Report {
        /// Run file or tag. If omitted, shows the latest run.
        run: Option<PathBuf>,

        /// Only show scopes down to this nesting depth.
        #[arg(long, value_name = "N")]
        depth: Option<usize>,

        /// Hide scopes taking less than this share of their parent.
        #[arg(long, value_name = "PERCENT", default_value_t = 0.0)]
        min_percent: f64,

        /// Aggregate by scope identifier instead of showing the tree.
        #[arg(long)]
        flat: bool,

        /// Show raw cycle counts instead of milliseconds.
        #[arg(long)]
        cycles: bool,
    },
    /// Compare two runs (files or tags) scope by scope.
    Diff {
        /// First run.
        a: PathBuf,
        /// Second run.
        b: PathBuf,

        /// Show raw cycle counts instead of milliseconds.
        #[arg(long)]
        cycles: bool,
    },
    /// Tag the latest run for easy reference.
    Tag {
        /// Tag name.
        name: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let dirs = Dirs {
        runs: cli.runs_dir.unwrap_or_else(default_runs_dir),
        tags: cli.tags_dir.unwrap_or_else(default_tags_dir),
    };
    match cli.command {
        Commands::Report {
            run,
            depth,
            min_percent,
            flat,
            cycles,
        } => cmd_report(&dirs, run, depth, min_percent, flat, cycles),
        Commands::Diff { a, b, cycles } => cmd_diff(&dirs, &a, &b, cycles),
        Commands::Tag { name } => cmd_tag(&dirs, &name),
    }
}

struct Dirs {
    runs: PathBuf,
    tags: PathBuf,
}

fn cmd_report(
    dirs: &Dirs,
    run: Option<PathBuf>,
    depth: Option<usize>,
    min_percent: f64,
    flat: bool,
    cycles: bool,
) -> Result<(), Error> {
    let report = match run {
        Some(arg) => resolve_run_arg(dirs, &arg)?,
        None => load_latest_run(&dirs.runs)?,
    };
    tracing::debug!(run_id = %report.run_id, threads = %report.thread, "loaded run");
    eprintln!("run {} ({})", report.run_id, report.thread);

    if flat {
        anstream::print!("{}", format_flat(&report, cycles));
    } else {
        let opts = TreeOptions {
            max_depth: depth,
            min_percent,
            cycles,
        };
        anstream::print!("{}", format_tree(&report, &opts));
    }
    Ok(())
}

fn cmd_diff(dirs: &Dirs, a: &Path, b: &Path, cycles: bool) -> Result<(), Error> {
    let run_a = resolve_run_arg(dirs, a)?;
    let run_b = resolve_run_arg(dirs, b)?;
    anstream::print!("{}", diff_runs(&run_a, &run_b, cycles));
    Ok(())
}

fn cmd_tag(dirs: &Dirs, name: &str) -> Result<(), Error> {
    let latest = load_latest_run(&dirs.runs)?;
    save_tag(&dirs.tags, name, &latest.run_id)?;
    eprintln!("tagged '{name}' -> {}", latest.run_id);
    Ok(())
}

/// A run file is loaded together with the other threads of its run; any
/// other argument is treated as a tag.
fn resolve_run_arg(dirs: &Dirs, arg: &Path) -> Result<TreeReport, Error> {
    if arg.is_file() {
        let run = load_run(arg)?;
        let siblings = arg.parent().filter(|p| !p.as_os_str().is_empty());
        return match siblings {
            Some(dir) => Ok(load_run_by_id(dir, &run.run_id)?.unwrap_or(run)),
            None => Ok(run),
        };
    }
    load_tagged_run(&dirs.tags, &dirs.runs, &arg.to_string_lossy())
}

fn default_runs_dir() -> PathBuf {
    calltree_runtime::runs_dir()
}

fn default_tags_dir() -> PathBuf {
    Path::new("target").join("calltree").join("tags")
}
