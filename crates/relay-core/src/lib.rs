//! # relay-core
//!
//! Foundation types shared by the relay server and its handlers.
//!
//! - [`Message`]: the JSON object envelope delivered to stream clients,
//!   with its `data: <json>\r\n\r\n` frame encoding
//! - [`ClientId`]: the opaque per-connection identity
//! - [`logging::init_subscriber`]: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod message;

pub use ids::ClientId;
pub use message::Message;
