//! Host-testable building blocks for the lepton runtime.
//!
//! This crate contains the pure-logic pieces of the runtime that need no
//! stacks, threads, or file descriptors: the park-state machine that powers
//! every suspend/resume, the intrusive MPSC queues backing the lock-free
//! ready-queue variants, and the CPU-list parser used by configuration.
//!
//! By living outside the runtime crate, these types can be tested with
//! plain `cargo test` (including multi-threaded stress tests) without
//! bootstrapping a scheduler.

#![warn(missing_docs)]

pub mod cpulist;
pub mod link;
pub mod park;
pub mod queue;

pub use link::QueueLink;
pub use park::{ParkState, ResumeOutcome, SuspendOutcome};
