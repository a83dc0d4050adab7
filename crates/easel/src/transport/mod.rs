//! Transports that carry bridge frames.
//!
//! - **listener**: accept the host peer over an axum WebSocket endpoint
//! - **dialer**: connect out to a listening peer or a relay
//! - **frame**: uniform text-frame halves over either socket type

pub mod dialer;
pub mod frame;
pub mod listener;

pub use dialer::{DialConfig, DialError, dial};
pub use frame::{FrameSink, FrameStream, TransportError, in_memory};
pub use listener::{ListenerConfig, serve};
