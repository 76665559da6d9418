//! Frequency-domain-aware control of CPU frequency governors.
//!
//! Devices share frequency hardware in [domains][Domain]: a governor or frequency written
//! through any member applies to every member. [`Cpufreq`] models that topology explicitly.
//! It discovers domains lazily, fans independent device accesses out concurrently, memoizes
//! immutable hardware facts with single-flight semantics and offers a scoped override
//! ([`Cpufreq::with_governor`]) that guarantees the previous configuration is put back.
//!
//! The device itself sits behind the [`device_target::Target`] trait, so everything here
//! works identically against real sysfs and against the in-memory fake.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//!
//! use device_target::fake::FakeTarget;
//! use freq_domains::Cpufreq;
//! use interleave::run_blocking;
//!
//! let target = FakeTarget::new()
//!     .with_online([0])
//!     .with_file(
//!         "/sys/devices/system/cpu/cpu0/cpufreq/affected_cpus",
//!         "0",
//!     )
//!     .with_file(
//!         "/sys/devices/system/cpu/cpu0/cpufreq/scaling_available_governors",
//!         "ondemand performance",
//!     )
//!     .with_file(
//!         "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor",
//!         "ondemand",
//!     )
//!     .with_file("/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq", "600000");
//!
//! let cpufreq = Cpufreq::new(target);
//!
//! let ran = run_blocking(cpufreq.with_governor(
//!     None,
//!     "performance",
//!     &BTreeMap::new(),
//!     async || {
//!         // Measure something while the governor cannot scale down.
//!         Ok(cpufreq.governor(0).await?)
//!     },
//! ))
//! .unwrap();
//!
//! assert_eq!(ran, "performance");
//!
//! // The scope put the previous governor back.
//! let after = run_blocking(cpufreq.governor(0)).unwrap();
//! assert_eq!(after, "ondemand");
//! ```

mod domain;
mod error;
mod frequencies;
mod governors;
mod policies;
mod scope;

pub use domain::*;
pub use error::*;
pub use policies::Cpufreq;
