//! The device collaborator boundary for power-management control.
//!
//! Kernel power-management state lives in a virtual filesystem on the controlled machine:
//! reading a governor is reading a file, switching it is writing one. This package defines
//! the [`Target`] trait, the complete set of primitives that control code needs from a
//! machine, together with a real implementation for the locally-attached machine
//! ([`LocalTarget`]) and a scripted one for tests ([`fake::FakeTarget`], behind the
//! `test-util` feature).
//!
//! The trait's methods are the suspension points of the whole control stack: coordination
//! layers interleave work at exactly these boundaries.
//!
//! # Example
//!
//! ```no_run
//! use device_target::{LocalTarget, Target};
//!
//! let target = LocalTarget::new();
//!
//! let governor = futures::executor::block_on(
//!     target.read_text("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor"),
//! )
//! .unwrap();
//!
//! println!("cpu0 runs the '{governor}' governor");
//! ```

mod error;
mod local;
mod target;

pub use error::*;
pub use local::*;
pub use target::*;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;
