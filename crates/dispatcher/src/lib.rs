//! Dispatcher side of the worker hub
//!
//! [`WorkerServer`] accepts worker WebSocket connections, authenticates their
//! registration and keeps a [`WorkerPool`] of connected capacity that callers
//! query to place work.

pub mod auth;
mod health;
pub mod http;
pub mod pool;
pub mod server;

pub use http::{FnHandler, HttpHandler, HttpOutcome, RouteHandler};
pub use pool::{ConnectedWorker, WorkerPool, WorkerSocket};
pub use server::{ServerState, WorkerDisconnected, WorkerServer};
