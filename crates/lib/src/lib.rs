//! treebuild-lib: the treebuild build engine
//!
//! This crate turns a manifest of pipelines into filesystem trees:
//! - `Manifest`: the parsed document
//! - `resolve`: validation, content-addressed ids and the pipeline graph
//! - `Store`: the content-addressable store of trees
//! - `Sandbox`: isolated execution of one step with its devices and mounts
//! - `execute`: the scheduler tying the above together

pub mod consts;
pub mod execute;
pub mod ipc;
pub mod manifest;
pub mod modules;
pub mod platform;
pub mod resolve;
pub mod sandbox;
pub mod sources;
pub mod store;
pub mod store_lock;
pub mod util;
