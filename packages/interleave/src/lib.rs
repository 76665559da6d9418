//! Cooperative task coordination for device-control code.
//!
//! Device-control logic is naturally expressed as suspendable operations: every read or write of
//! a device file is a point where other work could make progress. This package provides the
//! machinery to run such operations either as ordinary blocking calls or as coordinated
//! concurrent tasks, without writing the logic twice:
//!
//! * [`Scheduler`] drives suspendable work on a single-threaded cooperative pool, via a blocking
//!   façade ([`Scheduler::run_blocking`]) or a spawning façade ([`Scheduler::spawn`]) that
//!   returns an awaitable [`TaskHandle`].
//! * [`concurrently`] and [`map_concurrently`] fan work out across many inputs and fan the
//!   results back in under an ordering-preserving contract.
//! * [`SingleFlight`] memoizes the result of an operation per key and deduplicates concurrent
//!   cold misses so only one underlying device access occurs.
//!
//! Concurrency here is local, short-lived, and bounded to one coordinating call. All tasks
//! multiplex over one logical thread of control; suspension occurs only at explicit await
//! points, so "concurrent" means interleaved progress, never parallel threads.
//!
//! # Example
//!
//! ```
//! use interleave::{concurrently, run_blocking};
//!
//! let doubled = run_blocking(concurrently((0..4_u32).map(async move |n| {
//!     Ok::<_, std::convert::Infallible>(n * 2)
//! })))
//! .unwrap();
//!
//! assert_eq!(doubled, vec![0, 2, 4, 6]);
//! ```

mod coordinator;
mod scheduler;
mod single_flight;

pub use coordinator::*;
pub use scheduler::*;
pub use single_flight::*;
