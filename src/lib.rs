//! Addressed message transport.
//!
//! Services register under numeric ids or names; peers send them messages
//! through pooled connections found via a directory, optionally waiting for
//! a reply correlated by route id. Services with a receiver announce their
//! liveness to proxies with periodic chirps.
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use tether::{
//!     DirectoryChain, DriverRegistry, Registration, Transport, TransportConfig,
//!     directory::{Entry, StaticDirectory},
//! };
//!
//! let directory = StaticDirectory::new().with(Entry::new("", "echo", "tcp://127.0.0.1:7000"));
//! let transport = Transport::new(
//!     TransportConfig::default(),
//!     DriverRegistry::with_defaults(),
//!     DirectoryChain::new().with(Arc::new(directory)),
//! )?;
//!
//! let mut request = transport.allocate(0);
//! request.put_bytes(b"ping");
//! let reply = transport.send_and_wait("echo", request, Some(Duration::from_secs(2)))?;
//! println!("{:?}", reply.body());
//! transport.free(reply)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod config;
mod delivery;
pub mod directory;
pub mod driver;
mod error;
pub mod message;
mod operation;
pub mod protocol;
pub mod routing;
pub mod service;
mod sync;
mod transport;

pub use config::{DeliveryMode, PoolPolicy, TransportConfig};
pub use directory::DirectoryChain;
pub use driver::DriverRegistry;
pub use error::TransportError;
pub use message::{Message, MessagePool};
pub use operation::{OperationId, OperationKind, OperationStats, ReplyCallback, TransmitCallback};
pub use routing::Target;
pub use service::{Delivery, Liveness, Registration, ReturnToken};
pub use transport::{SendOptions, Transport, TransportStats};
