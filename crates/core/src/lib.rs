//! Domain types shared by every `jobwatch` crate.
//!
//! Nothing in here performs I/O. Connection state, job status
//! normalization, update validation and dependency graph leveling are
//! all plain functions over plain data.

pub mod connection;
pub mod dependency_graph;
pub mod error;
pub mod job_status;
pub mod status;
pub mod types;
pub mod wire;
