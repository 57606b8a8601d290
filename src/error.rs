use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no calltree runs found in {} -- call calltree_runtime::flush() in the profiled program", .0.display())]
    NoRuns(PathBuf),

    #[error("no run found for tag '{tag}' -- run `calltree tag` to create one")]
    RunNotFound { tag: String },

    #[error("failed to read run file {}: {source}", path.display())]
    RunReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid run data in {}: {reason}", path.display())]
    InvalidRunData { path: PathBuf, reason: String },

    #[error("invalid tag name '{0}' -- use letters, digits, '-', '_' or '.'")]
    InvalidTagName(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
