//! A concurrent mark-and-sweep garbage collector core.
//!
//! `cms-gc` manages a heap of typed objects described by static
//! [`TypeInfo`] descriptors. Collections stop the world only while the root
//! set is collected; marking and sweeping then run on a dedicated collector
//! thread while mutators continue. Unreachable objects whose type declares a
//! finalizer are handed to a finalizer thread instead of being freed.
//!
//! # Features
//!
//! - **Intrusive mark queue**: the mark bit and the worklist link share one
//!   word per object, with a CAS-guarded enqueue
//! - **Pluggable marking policy**: the traversal is written once against
//!   [`MarkingPolicy`](gc::MarkingPolicy)
//! - **Epoch protocol**: concurrent collection requests merge into one
//!   collection; blocking requests return only once it completed
//! - **Weak references and foreign handles** tracked by auxiliary records
//!
//! # Quick Start
//!
//! ```
//! use cms_gc::{GcConfig, Runtime, TypeInfo, WORD};
//!
//! static NODE: TypeInfo = TypeInfo::object("Node", 2 * WORD, &[0, WORD]);
//!
//! let runtime = Runtime::new(GcConfig::default());
//! let mutator = runtime.attach_thread();
//!
//! let head = mutator.allocate(&NODE).unwrap();
//! mutator.push_root(Some(head));
//! let tail = mutator.allocate(&NODE).unwrap();
//! head.store_field(0, Some(tail));
//! mutator.allocate(&NODE).unwrap(); // garbage
//!
//! mutator.collect();
//! let sweep = runtime.statistics().last_sweep_stats().unwrap();
//! assert_eq!(sweep.kept, 2);
//! assert_eq!(sweep.swept, 1);
//! ```
//!
//! # Threads
//!
//! Every thread touching the heap attaches through
//! [`Runtime::attach_thread`] and keeps the returned [`Mutator`]. A mutator
//! must reach a safepoint regularly (allocation does this implicitly) and
//! wraps blocking work in [`Mutator::run_native`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod extra;
pub mod gc;
pub mod heap;
pub mod metrics;
mod mutator;
pub mod object;
pub mod roots;
mod runtime;
pub mod thread;
pub mod tracing;

pub use config::{GcConfig, MarkingBehavior};
pub use context::MemoryContext;
pub use error::AllocError;
pub use extra::{weak_referent, ForeignHandle};
pub use gc::{ConcurrentMarkAndSweep, GcPhase};
pub use heap::{allocated_size, mark_state, MarkState};
pub use metrics::{GcInfo, GcStatistics, MarkStats, MemoryUsage, RootSetStatistics, SweepStats};
pub use mutator::{Mutator, RootScope};
pub use object::{NonHeapObject, ObjRef, TypeInfo, TypeKind, WORD};
pub use roots::{GlobalRoot, RootSlot, StableRef};
pub use runtime::Runtime;
pub use thread::ThreadState;
