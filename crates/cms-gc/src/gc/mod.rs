//! Collection coordination.
//!
//! This module provides the collector itself:
//! - The intrusive list backing the mark and finalizer queues
//! - The generic mark-and-sweep traversal and its marking policy interface
//! - The concurrent collector, its request protocol and the finalizer thread
//! - Lock ordering discipline for deadlock prevention

pub mod cms;
pub mod finalizer;
pub mod list;
pub mod mark_sweep;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod thread_data;

pub use cms::{ConcurrentMarkAndSweep, IntrusiveMarking};
pub use finalizer::FinalizerProcessor;
pub use mark_sweep::MarkingPolicy;
pub use scheduler::{GcScheduler, SchedulerThreadData, ThresholdScheduler};
pub use state::{GcPhase, GcRequest, GcStateHolder};
