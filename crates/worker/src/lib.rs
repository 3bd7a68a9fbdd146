//! Worker side of the worker hub
//!
//! [`ReconnectingWebSocket`] keeps a link to the dispatcher alive across
//! failures; [`WorkerAgent`] runs the registration protocol on top of it.

pub mod backoff;
pub mod components;
pub mod token;

pub use backoff::get_backoff_delay;
pub use components::{
    ClientEvent, ConnectionOptions, ConnectionState, ReconnectingWebSocket, RequestPermit,
    WorkerAgent,
};
pub use token::{
    calculate_token_refresh_time, IssuedToken, RefreshingTokenProvider, StaticTokenProvider,
    TokenProvider, TokenSource,
};
