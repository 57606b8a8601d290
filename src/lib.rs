//! Reading and rendering calltree run files.
//!
//! The profiled program writes one JSON document per thread with
//! `calltree_runtime::flush()`. This crate loads them back, merges the
//! threads of a run, and renders tree, flat and diff views.

pub mod error;
pub mod report;
