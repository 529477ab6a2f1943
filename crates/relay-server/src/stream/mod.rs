//! Event-stream sessions: fan-out, per-connection workers, and callbacks.

pub mod callback;
pub mod connection;
pub mod fanout;
pub mod handler;
pub mod hub;
pub mod keepalive;
pub mod registry;
pub mod session;
