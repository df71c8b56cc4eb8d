//! Built-in interceptors.

mod auth;
mod keepalive;
mod logging;
mod metrics;
mod retry;

pub use auth::*;
pub use keepalive::*;
pub use logging::*;
pub use metrics::*;
pub use retry::*;
