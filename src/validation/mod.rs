//! Layered connectivity validation.
//!
//! Diagnoses *why* a cluster connection is unusable by checking, in order,
//! TCP reachability, SSH command execution, SFTP file access and SLURM
//! availability. Each layer reports its own errors; the aggregate adds
//! remediation hints for whatever failed.

pub mod connectivity;
pub mod types;

#[cfg(test)]
mod tests;

pub use connectivity::{ConnectivityValidator, NetworkProbe, TcpProbe};
pub use types::*;
