//! qvm: a single-host QEMU VM pool manager.
//!
//! Live state (process, address, reachability) is never stored. It is
//! recomputed on every query from the process table, the neighbor table,
//! DNS and the serial console transcript; see [`net::resolver`] and
//! [`status`]. The registry holds static configuration only.

pub mod arch;
pub mod backup;
pub mod config;
pub mod error;
pub mod hosts;
pub mod logging;
pub mod net;
pub mod paths;
pub mod registry;
pub mod status;
pub mod vm;

pub use error::{QvmError, Result};
