//! Wire protocol spoken between transports.
//!
//! Every frame starts with a big-endian fixed header followed by the message
//! body. The header carries the target the frame is addressed to, and for
//! frames that expect an answer, the route id and route timeout.
//!
//! # Overview
//!
//! ```text
//!  0        4          7    8     10   11   12       16       20      24      28
//!  +--------+----------+----+-----+----+----+--------+--------+-------+-------+
//!  | length | "SAG"    |ver | hlen|ttl |pri | target | seq(0) | route |timeout|
//!  +--------+----------+----+-----+----+----+--------+--------+-------+-------+
//! ```
//!
//! The route and timeout words are only present when a route is set, so the
//! header is 20 bytes for plain sends and 28 bytes for routed ones.
//!
//! Negative targets are reserved for control traffic: route returns and
//! failures, name resolution, liveness chirps, proxy registration and client
//! binding. See [`ControlCode`].
//!
//! # Key Components
//!
//! - [`Header`]: decoded fixed header, with [`encode`] and [`decode`] for whole
//!   frames.
//! - [`ProtocolTransport`]: frame reader/writer over any `Read + Write` stream.
//! - [`control`]: control codes and the payloads control frames carry.
//!
//! # See Also
//!
//! - [`message`](crate::message): the pooled buffers frames decode into.
//! - [`driver`](crate::driver): the transports that move frames.
pub mod control;
mod header;
mod transport;

pub use control::{ControlCode, ControlError};
pub use header::{
    BASE_HEADER_LENGTH, FrameError, HEALTH_MARKER, Header, MAGIC, MIN_FRAME_LENGTH,
    PREFIX_LENGTH, ROUTED_HEADER_LENGTH, VERSION, VERSION_LIMIT, decode, encode,
};
pub use transport::ProtocolTransport;
