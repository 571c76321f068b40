//! Domain types - core broker entities
//!
//! Project identity and configuration, independent of process or IPC concerns.

pub mod config;
pub mod project;
