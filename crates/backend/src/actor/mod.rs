//! Actor-based instance management
//!
//! Every engine instance is owned by a long-lived task that processes its
//! mailbox one message at a time. Nothing else touches the engine, so there
//! is no lock around it: the queue is the mutual exclusion.
//!
//! # Actors
//!
//! - [`InstanceActor`](instance::InstanceActor): owns one engine session and its state machine
//! - [`InstanceRegistry`]: get-or-create for instances, one per project
//! - [`HealthSupervisor`]: periodic probes and idle shutdown
//!
//! ```text
//! Project Server -> InstanceRegistry -> InstanceHandle -> InstanceActor -> engine
//!                                            ^                 |
//!                                            +---- oneshot ----+
//! ```

pub mod handle;
pub mod instance;
pub mod lifecycle;
pub mod message;
mod registry;
mod supervisor;

#[cfg(test)]
pub(crate) mod __tests__;

pub use registry::{InstanceRegistry, InstanceRegistryError};
pub use supervisor::{HealthSupervisor, SupervisorConfig};
