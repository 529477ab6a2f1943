//! # relay-server
//!
//! Axum server that hosts event-stream endpoints.
//!
//! Each endpoint registered with [`RelayServer::register_stream_endpoint`]
//! gets a [`StreamHub`]: a broadcast fan-out, a registry of live sessions, and
//! a factory producing one [`EventHandler`] per connection. Clients open a
//! stream on `{path}` and talk back through `{path}/callback`, naming their
//! connection by client id.
//!
//! - [`config`]: server and stream settings, file and env loading
//! - [`request`]: the request snapshot handed to every hook
//! - [`stream`]: sessions, fan-out, connection workers, callbacks
//! - [`server`]: routing, listening, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod request;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use config::{ServerConfig, StreamSettings};
pub use errors::{HandlerError, StreamError};
pub use request::StreamRequest;
pub use server::RelayServer;
pub use stream::handler::{EventHandler, HandlerFactory, NoopHandler, handler_factory};
pub use stream::hub::StreamHub;
pub use stream::session::Session;
