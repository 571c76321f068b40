//! Lifecycle tracking for Project Server auto-shutdown.

pub mod activity;
