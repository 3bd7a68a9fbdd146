pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod request_tracker;

pub use config::*;
pub use errors::*;
pub use events::{EventListeners, Subscription};
pub use models::*;
pub use request_tracker::RequestTracker;
