mod client;
mod middleware;
mod nak_backoff;
mod tower_consumer;
mod trace_context;
mod traits;

pub use client::*;
pub use middleware::*;
pub use nak_backoff::*;
pub use tower_consumer::*;
pub use trace_context::*;
pub use traits::*;
