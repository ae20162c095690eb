//! mixbuild-lib: compile Bazel action graphs into build statements
//!
//! This crate turns a serialized `bazel aquery` action-graph dump into the
//! concrete build steps a downstream executor can register:
//! - `graph`: the deserialized action-graph data model
//! - `index`: artifact/depset lookup tables with middleman substitution
//! - `flatten`: memoized depset flattening
//! - `compile`: per-mnemonic action lowering into `BuildStatement`s
//!
//! The whole pipeline is a pure, synchronous, per-invocation transformation:
//! no I/O, no process execution, no state shared between compilations.

pub mod compile;
pub mod consts;
pub mod error;
pub mod flatten;
pub mod graph;
pub mod index;
pub mod shell;

pub use compile::{BuildStatement, CompileOutput, compile};
pub use error::CompileError;
pub use graph::ActionGraph;
pub use index::{ContentHash, Depset};
