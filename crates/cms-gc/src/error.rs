//! Error types and fatal invariant handling.
//!
//! The collector has no recoverable error path of its own. The only error a
//! caller ever sees is [`AllocError`], returned from allocation after the
//! out-of-memory path already tried a synchronous collection. Everything else
//! that goes wrong inside the collector is heap corruption and aborts the
//! process through [`gc_assert!`](crate::gc_assert).

use std::fmt;

/// Allocation failure surfaced to the mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The configured heap limit would be exceeded by this allocation.
    HeapLimitExceeded {
        /// Bytes requested by the failed allocation.
        requested: usize,
        /// The configured limit in bytes.
        limit: usize,
    },
    /// The system allocator returned null.
    OutOfMemory {
        /// Bytes requested by the failed allocation.
        requested: usize,
    },
    /// The requested object or array size does not fit in `usize`.
    SizeOverflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapLimitExceeded { requested, limit } => write!(
                f,
                "heap limit of {limit} bytes exceeded by allocation of {requested} bytes"
            ),
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory while allocating {requested} bytes")
            }
            Self::SizeOverflow => f.write_str("allocation size overflow"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Report a broken heap invariant and abort.
///
/// Not meant to be called directly; use [`gc_assert!`](crate::gc_assert).
#[cold]
#[inline(never)]
#[doc(hidden)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(reason = %args, "fatal collector invariant violation");
    eprintln!("[GC] FATAL: {args}");
    std::process::abort()
}

/// Check a heap invariant; abort the process with a diagnostic when it does not hold.
#[macro_export]
macro_rules! gc_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal(format_args!($($arg)+));
        }
    };
}
