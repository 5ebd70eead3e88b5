//! hive: run a dependency-ordered task graph with parallel workers, one
//! level at a time, merging every level's output before the next begins.

pub mod backpressure;
pub mod circuit;
pub mod config;
pub mod errors;
pub mod graph;
pub mod logging;
pub mod merge;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod sync;
pub mod util;
pub mod worker;
