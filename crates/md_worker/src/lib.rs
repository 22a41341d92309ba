pub mod domain;
pub mod md_worker;
pub mod nats;
pub mod postgres;

pub use domain::*;
pub use md_worker::*;
pub use nats::*;
pub use postgres::*;
