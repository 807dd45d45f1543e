//! Replays a recorded packet-timing trace on a live link.
//!
//! Packets bound for one target host are intercepted through NFQUEUE,
//! matched against a loaded schedule, parked, and handed back to the kernel
//! when their recorded release time comes up on the local clock.

pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod gate;
pub mod hold_queue;
pub mod interceptor;
pub mod ip_header;
pub mod releaser;
pub mod replay;
pub mod schedule;
pub mod signal;
pub mod stats;

pub use error::{ReplayError, Result};
pub use replay::ReplayContext;
