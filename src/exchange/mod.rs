//! Attribute exchange
//!
//! The socket protocol through which other processes read the attribute store,
//! most importantly the acquisition program's extension fetching temperature,
//! pressure and position at the end of a scan. That extension blocks until it gets
//! an answer, so the server always answers from the store as it is, stale or not.
//!
//! - [`protocol`]: line codec shared by both ends
//! - [`ExchangeServer`]: listener with one task per connection
//! - [`ExchangeClient`]: client, also usable as a link adapter and as a remote
//!   snapshot source

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ExchangeClient, RemoteStore};
pub use protocol::{Record, Reply, Request};
pub use server::{ExchangeServer, RequestHandler};
