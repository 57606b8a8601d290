//! Ambient per-thread profiler and the RAII `ScopeGuard`.
//!
//! Each thread lazily gets its own `ProfileTree`; a single process-wide
//! switch gates every ambient call. `scope(id)` enters on construction and
//! exits when the guard drops, on every exit path including unwinding.
//!
//! Built without the `enabled` feature, every function here is an inlined
//! no-op and `ScopeGuard` is zero-sized, so call sites stay unconditional.

use std::borrow::Cow;
use std::cell::RefCell;
use std::io;
use std::path::{Path, PathBuf};

use crate::report::TreeReport;
use crate::tree::ProfileTree;

/// Environment variable overriding where run files are written.
pub const RUNS_DIR_ENV: &str = "CALLTREE_RUNS_DIR";

/// `CALLTREE_RUNS_DIR`, else `target/calltree/runs`.
pub fn runs_dir() -> PathBuf {
    match std::env::var_os(RUNS_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => Path::new("target").join("calltree").join("runs"),
    }
}

#[cfg(feature = "enabled")]
mod enabled {
    use std::fs::{File, OpenOptions};
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::report::timestamp_ms;

    static ACTIVE: AtomicBool = AtomicBool::new(true);

    thread_local! {
        static TREE: RefCell<ProfileTree> = RefCell::new(ProfileTree::new());
    }

    enum Target<'t> {
        Inert,
        Local,
        Tree(&'t RefCell<ProfileTree>),
    }

    /// Closes its scope when dropped. Must drop on the thread that made it.
    #[must_use = "dropping the guard immediately closes the scope; bind it with `let _scope = ...`"]
    pub struct ScopeGuard<'t> {
        target: Target<'t>,
        _not_send: PhantomData<*const ()>,
    }

    impl ScopeGuard<'_> {
        fn new(target: Target<'_>) -> ScopeGuard<'_> {
            ScopeGuard {
                target,
                _not_send: PhantomData,
            }
        }

        /// False when the profiler was off at construction.
        pub fn is_recording(&self) -> bool {
            !matches!(self.target, Target::Inert)
        }
    }

    impl Drop for ScopeGuard<'_> {
        fn drop(&mut self) {
            match self.target {
                Target::Inert => {}
                Target::Local => exit(),
                Target::Tree(tree) => {
                    if let Ok(mut tree) = tree.try_borrow_mut() {
                        tree.exit();
                    }
                }
            }
        }
    }

    /// Open a scope on the calling thread's tree.
    #[inline]
    pub fn scope(id: impl Into<Cow<'static, str>>) -> ScopeGuard<'static> {
        if enter_local(id.into()) {
            ScopeGuard::new(Target::Local)
        } else {
            ScopeGuard::new(Target::Inert)
        }
    }

    /// Open a scope on an explicitly owned tree, gated by that tree's own
    /// active flag rather than the process-wide switch.
    #[inline]
    pub fn scope_in(
        tree: &RefCell<ProfileTree>,
        id: impl Into<Cow<'static, str>>,
    ) -> ScopeGuard<'_> {
        match tree.try_borrow_mut() {
            Ok(mut t) if t.is_active() => {
                t.enter(id);
                ScopeGuard::new(Target::Tree(tree))
            }
            _ => ScopeGuard::new(Target::Inert),
        }
    }

    fn enter_local(id: Cow<'static, str>) -> bool {
        if !is_active() {
            return false;
        }
        TREE.try_with(|tree| match tree.try_borrow_mut() {
            Ok(mut tree) => {
                tree.enter(id);
                true
            }
            Err(_) => false,
        })
        .unwrap_or(false)
    }

    /// Enter a scope without a guard. Must be paired with `exit()`.
    #[inline]
    pub fn enter(id: impl Into<Cow<'static, str>>) {
        enter_local(id.into());
    }

    /// Leave the innermost scope opened with `enter()`.
    #[inline]
    pub fn exit() {
        if !is_active() {
            return;
        }
        let _ = TREE.try_with(|tree| {
            if let Ok(mut tree) = tree.try_borrow_mut() {
                tree.exit();
            }
        });
    }

    /// Zero the calling thread's statistics, keeping the tree shape.
    pub fn new_frame() {
        if !is_active() {
            return;
        }
        let _ = TREE.try_with(|tree| {
            if let Ok(mut tree) = tree.try_borrow_mut() {
                tree.new_frame();
            }
        });
    }

    /// Flip the process-wide switch. Statistics are kept either way.
    pub fn set_active(active: bool) {
        ACTIVE.store(active, Ordering::Release);
    }

    pub fn is_active() -> bool {
        ACTIVE.load(Ordering::Acquire)
    }

    /// Read the calling thread's tree.
    ///
    /// Scopes opened from inside `f` are not recorded.
    pub fn with_tree<R>(f: impl FnOnce(&ProfileTree) -> R) -> R {
        TREE.with(|tree| f(&tree.borrow()))
    }

    /// Snapshot the calling thread's tree.
    pub fn report() -> TreeReport {
        with_tree(TreeReport::from_tree)
    }

    /// Write the calling thread's tree to `<dir>/<timestamp_ms>.json`.
    ///
    /// Returns `Ok(None)` when nothing has been recorded yet.
    pub fn flush_to(dir: &Path) -> io::Result<Option<PathBuf>> {
        if with_tree(ProfileTree::is_empty) {
            return Ok(None);
        }
        let report = report();
        let (file, path) = create_run_file(dir, timestamp_ms())?;
        report.write_json_to(file)?;
        tracing::debug!(path = %path.display(), thread = %report.thread, "wrote run file");
        Ok(Some(path))
    }

    /// `flush_to(runs_dir())`, logging instead of returning I/O errors.
    pub fn flush() -> Option<PathBuf> {
        let dir = runs_dir();
        match flush_to(&dir) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), %err, "failed to write run file");
                None
            }
        }
    }

    /// Release the calling thread's tree. The next scope starts a fresh one.
    pub fn shutdown() {
        let _ = TREE.try_with(|tree| {
            if let Ok(mut tree) = tree.try_borrow_mut() {
                let old = std::mem::take(&mut *tree);
                tracing::debug!(nodes = old.len(), "released call tree");
            }
        });
    }

    /// Create `<ts>.json`, or the first free `<ts>_<n>.json`, without
    /// ever truncating another thread's run file.
    pub(super) fn create_run_file(dir: &Path, ts: u64) -> io::Result<(File, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        for n in 0u32.. {
            let path = if n == 0 {
                dir.join(format!("{ts}.json"))
            } else {
                dir.join(format!("{ts}_{n}.json"))
            };
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free run file name",
        ))
    }
}

#[cfg(not(feature = "enabled"))]
mod disabled {
    use std::marker::PhantomData;

    use super::*;

    /// No-op scope guard.
    #[must_use = "dropping the guard immediately closes the scope; bind it with `let _scope = ...`"]
    pub struct ScopeGuard<'t>(PhantomData<(&'t (), *const ())>);

    impl ScopeGuard<'_> {
        #[inline]
        pub fn is_recording(&self) -> bool {
            false
        }
    }

    #[inline]
    pub fn scope(_id: impl Into<Cow<'static, str>>) -> ScopeGuard<'static> {
        ScopeGuard(PhantomData)
    }

    #[inline]
    pub fn scope_in(
        _tree: &RefCell<ProfileTree>,
        _id: impl Into<Cow<'static, str>>,
    ) -> ScopeGuard<'_> {
        ScopeGuard(PhantomData)
    }

    #[inline]
    pub fn enter(_id: impl Into<Cow<'static, str>>) {}

    #[inline]
    pub fn exit() {}

    #[inline]
    pub fn new_frame() {}

    #[inline]
    pub fn set_active(_active: bool) {}

    #[inline]
    pub fn is_active() -> bool {
        false
    }

    pub fn with_tree<R>(f: impl FnOnce(&ProfileTree) -> R) -> R {
        f(&ProfileTree::new())
    }

    pub fn report() -> TreeReport {
        with_tree(TreeReport::from_tree)
    }

    #[inline]
    pub fn flush_to(_dir: &Path) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }

    #[inline]
    pub fn flush() -> Option<PathBuf> {
        None
    }

    #[inline]
    pub fn shutdown() {}
}

#[cfg(feature = "enabled")]
pub use enabled::{
    enter, exit, flush, flush_to, is_active, new_frame, report, scope, scope_in, set_active,
    shutdown, with_tree, ScopeGuard,
};

#[cfg(not(feature = "enabled"))]
pub use disabled::{
    enter, exit, flush, flush_to, is_active, new_frame, report, scope, scope_in, set_active,
    shutdown, with_tree, ScopeGuard,
};

#[cfg(all(test, feature = "enabled"))]
mod tests {
    use super::*;

    fn path_calls(path: &[&str]) -> Option<u32> {
        with_tree(|t| t.find_path(path).map(|n| n.stats().call_count))
    }

    #[test]
    fn guard_enters_and_exits() {
        shutdown();
        {
            let _a = scope("A");
            {
                let _b = scope("B");
                assert_eq!(with_tree(|t| t.current().id().to_owned()), "B");
            }
            assert_eq!(with_tree(|t| t.current().id().to_owned()), "A");
        }
        assert!(with_tree(|t| t.current().is_root()));
        assert_eq!(path_calls(&["A"]), Some(1));
        assert_eq!(path_calls(&["A", "B"]), Some(1));
    }

    #[test]
    fn guard_exits_on_early_return_and_panic() {
        shutdown();
        fn early(flag: bool) -> u32 {
            let _s = scope("early");
            if flag {
                return 1;
            }
            2
        }
        assert_eq!(early(true), 1);
        assert_eq!(early(false), 2);

        let caught = std::panic::catch_unwind(|| {
            let _s = scope("panics");
            panic!("boom");
        });
        assert!(caught.is_err());

        assert!(with_tree(|t| t.current().is_root()));
        assert_eq!(path_calls(&["early"]), Some(2));
        assert_eq!(path_calls(&["panics"]), Some(1));
    }

    #[test]
    fn scope_in_uses_explicit_tree() {
        shutdown();
        let tree = RefCell::new(ProfileTree::new());
        {
            let g = scope_in(&tree, "explicit");
            assert!(g.is_recording());
            let _inner = scope_in(&tree, String::from("inner"));
        }
        let tree = tree.into_inner();
        assert!(tree.current().is_root());
        assert!(tree.find_path(&["explicit", "inner"]).is_some());
        assert!(with_tree(ProfileTree::is_empty));
    }

    #[test]
    fn scope_in_respects_tree_flag() {
        let tree = RefCell::new(ProfileTree::new());
        tree.borrow_mut().set_active(false);
        let g = scope_in(&tree, "skipped");
        assert!(!g.is_recording());
        drop(g);
        assert!(tree.borrow().is_empty());
    }

    #[test]
    fn scopes_inside_with_tree_are_skipped() {
        shutdown();
        with_tree(|_| {
            let g = scope("reentrant");
            assert!(!g.is_recording());
        });
        assert!(with_tree(ProfileTree::is_empty));
    }

    #[test]
    fn threads_get_independent_trees() {
        shutdown();
        let _main = scope("main_work");
        let worker = std::thread::spawn(|| {
            {
                let _w = scope("worker_work");
            }
            with_tree(|t| {
                (
                    t.find_path(&["worker_work"]).is_some(),
                    t.find_path(&["main_work"]).is_some(),
                )
            })
        })
        .join()
        .unwrap();
        assert_eq!(worker, (true, false));
        assert!(with_tree(|t| t.find_path(&["worker_work"]).is_none()));
    }

    #[test]
    fn flush_to_skips_empty_tree_and_writes_run() {
        shutdown();
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(flush_to(dir.path()).unwrap(), None);

        {
            let _s = scope("flushed");
        }
        let first = flush_to(dir.path()).unwrap().unwrap();
        let second = flush_to(dir.path()).unwrap().unwrap();
        assert_ne!(first, second);

        let text = std::fs::read_to_string(&first).unwrap();
        let report: TreeReport = serde_json::from_str(&text).unwrap();
        assert_eq!(report.find(&["flushed"]).unwrap().calls, 1);
    }

    #[test]
    fn run_file_names_never_clobber_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("42.json");
        std::fs::write(&taken, "other thread").unwrap();
        std::fs::write(dir.path().join("42_1.json"), "another").unwrap();

        let (_file, path) = super::enabled::create_run_file(dir.path(), 42).unwrap();
        assert_eq!(path, dir.path().join("42_2.json"));
        assert_eq!(std::fs::read_to_string(&taken).unwrap(), "other thread");
    }

    #[test]
    fn concurrent_flushes_write_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.path().to_path_buf();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    {
                        let _s = scope("flush_race");
                    }
                    barrier.wait();
                    flush_to(&dir).unwrap().unwrap()
                })
            })
            .collect();
        let mut paths: Vec<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 8);
        for path in &paths {
            let report: TreeReport =
                serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
            assert_eq!(report.find(&["flush_race"]).unwrap().calls, 1);
        }
    }

    #[test]
    fn shutdown_releases_tree() {
        {
            let _s = scope("before_shutdown");
        }
        shutdown();
        assert!(with_tree(ProfileTree::is_empty));
    }
}
