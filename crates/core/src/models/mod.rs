//! # Data model
//!
//! Shared types for the worker dispatch hub: what a worker can serve, the
//! snapshot of a connected worker, and the JSON wire protocol spoken over the
//! worker socket.
//!
//! ## Core models
//!
//! ### WorkerCapabilities
//! Models a worker serves plus its global and per-category concurrency caps.
//!
//! ### WorkerInfo
//! Socket-free snapshot of a connected worker, used for status reporting and
//! as the value handed to connect/disconnect listeners.
//!
//! ### ControlMessage
//! The registration handshake (`worker_registration` and
//! `worker_registration_ack`). Every other message is caller-defined JSON with a
//! `type` discriminator and is routed as a raw [`serde_json::Value`].
//!
//! ## Worker status
//!
//! ```text
//! Available <-> Busy        (load reaches / drops below max_concurrent_requests)
//!     \         /
//!      Unhealthy            (heartbeat older than the sweep timeout)
//! ```

pub mod message;
pub mod worker;

pub use message::*;
pub use worker::*;
