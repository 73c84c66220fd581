//! Bookkeeping behind addressing: which link reaches a target, which links
//! can be reused, and which operation waits on which route.
//!
//! Each registry guards its state with its own lock and never performs I/O
//! while holding it.
pub mod connection;
pub mod correlation;
pub mod target;

pub use connection::{ConnectionPool, Link};
pub use correlation::{RouteEntry, RouteTable};
pub use target::{Target, TargetRecord, TargetRegistry};
