//! Bootstrap and memory tracking core of a hosted virtual machine monitor
//! driver.
//!
//! This crate re-exports the vmmon workspace behind a single facade:
//!
//! - [`vmmon_core`] types are available at the crate root.
//! - [`arch::amd64`] holds the x86-64 page table format.
//! - [`phystrack`] and [`memtrack`] are the two per-VM trackers.
//! - [`bootstrap`] holds the VMM blob loader and the monitor loader.
//! - [`host_sim`] is an in-process host used by tests and demos.
//!
//! # Example
//!
//! ```
//! use vmmon::{
//!     Mpn, VmLock,
//!     host_sim::SimHost,
//!     phystrack::PhysTracker,
//! };
//! use std::sync::Arc;
//!
//! let host = SimHost::new();
//! let lock = Arc::new(VmLock::new());
//! let mut tracker = PhysTracker::new(Arc::clone(&lock));
//!
//! let _guard = lock.lock();
//! tracker.add(&host, Mpn(0x1234)).unwrap();
//! assert!(tracker.test(Mpn(0x1234)));
//!
//! tracker.remove(Mpn(0x1234));
//! tracker.destroy(&host);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use vmmon_core::*;

pub mod arch {
    //! Architecture-specific page table formats.

    pub mod amd64 {
        //! x86-64 four-level paging.
        pub use vmmon_arch_amd64::*;
    }
}

#[cfg(feature = "phystrack")]
#[cfg_attr(docsrs, doc(cfg(feature = "phystrack")))]
pub use vmmon_phystrack as phystrack;

#[cfg(feature = "memtrack")]
#[cfg_attr(docsrs, doc(cfg(feature = "memtrack")))]
pub use vmmon_memtrack as memtrack;

#[cfg(feature = "bootstrap")]
#[cfg_attr(docsrs, doc(cfg(feature = "bootstrap")))]
pub use vmmon_bootstrap as bootstrap;

#[cfg(feature = "host-sim")]
#[cfg_attr(docsrs, doc(cfg(feature = "host-sim")))]
pub use vmmon_host_sim as host_sim;
