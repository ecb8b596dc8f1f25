pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod runner;
pub mod sinks;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
