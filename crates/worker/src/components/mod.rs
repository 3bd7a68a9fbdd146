pub mod agent;
pub mod connection;

pub use agent::{RequestPermit, WorkerAgent};
pub use connection::{ClientEvent, ConnectionOptions, ConnectionState, ReconnectingWebSocket};
