//! Conductor drives a feature's task graph to completion: it assigns ready
//! tasks to an edit agent, verifies each attempt with build and lint checks,
//! gates finished work through a review agent, and unblocks dependents as
//! tasks are accepted.

pub mod agents;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod workspace;

pub use error::{Error, Result};
