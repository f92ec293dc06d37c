#![forbid(unsafe_code)]

//! Snowflake-family id generator with a drift tolerance protocol and a
//! durable worker-id allocator backed by a shared database.

pub mod clock;
pub mod config;
pub mod generator;
pub mod global;
pub mod worker;

pub use self::{
    clock::{SystemClock, TimeSource},
    config::Config,
    generator::Snowflake,
    worker::{AnyWorker, Info, Worker},
};
