//! Hierarchical call-tree profiler.
//!
//! Scopes are recorded into a tree keyed by call nesting. Every node keeps
//! call count plus total, max and min cycles across repeated invocations, and
//! `new_frame()` zeroes the statistics without forgetting the tree shape.
//!
//! ```
//! fn update() {
//!     calltree_runtime::profile_function!();
//!     {
//!         calltree_runtime::profile_scope!("physics");
//!     }
//! }
//!
//! for _ in 0..3 {
//!     calltree_runtime::new_frame();
//!     update();
//! }
//! let report = calltree_runtime::report();
//! # let _ = report;
//! ```
#![allow(unsafe_code)]

mod report;
mod scope;
mod stats;
mod tree;
pub mod tsc;

pub use calltree_macros::profiled;
pub use report::{NodeReport, TreeReport};
pub use scope::{
    enter, exit, flush, flush_to, is_active, new_frame, report, runs_dir, scope, scope_in,
    set_active, shutdown, with_tree, ScopeGuard, RUNS_DIR_ENV,
};
pub use stats::NodeStats;
pub use tree::{percent_of, Children, NodeId, NodeRef, ProfileTree, TreeError, ROOT_ID};

/// Path of the enclosing function, e.g. `my_crate::physics::step`.
#[macro_export]
macro_rules! function_name {
    () => {{
        fn __calltree_here() {}
        fn __calltree_type_name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = __calltree_type_name_of(__calltree_here);
        name.strip_suffix("::__calltree_here").unwrap_or(name)
    }};
}

/// Time the rest of the enclosing block under `id`.
#[macro_export]
macro_rules! profile_scope {
    ($id:expr) => {
        let _calltree_scope = $crate::scope($id);
    };
}

/// Time the rest of the enclosing function under its own path.
#[macro_export]
macro_rules! profile_function {
    () => {
        let _calltree_scope = $crate::scope($crate::function_name!());
    };
}
