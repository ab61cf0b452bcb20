//! Per-user remote workspace.
//!
//! [`paths`] computes and validates every remote path from `(user, job id)`;
//! [`WorkspaceManager`] provisions, lists, validates and cleans the
//! `/projects/{user}/namdrunner_jobs` tree over the capability ports.

pub mod manager;
pub mod paths;

#[cfg(test)]
mod tests;

pub use manager::*;
pub use paths::{ExtendedJobPaths, JobPaths, LogFiles};
