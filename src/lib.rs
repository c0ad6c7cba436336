//! jupyter-keeper: lifecycle manager for on-demand Jupyter notebook sessions.
//!
//! Starts sessions through an external launcher under a host memory budget,
//! expires them after their time-to-live, and keeps a durable port-keyed
//! registry reconciled against the live process table.

pub mod config;
pub mod error;
pub mod instance;
pub mod logging;
pub mod paths;
pub mod server;
