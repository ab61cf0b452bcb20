//! CLI-specific functionality for the connection tool
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, CleanupConfig, ExecutionMode, GlobalOptions, SessionAction};
pub use config::{AppConfig, ClusterConfig, ConfigDiscovery, WorkspaceConfig};
