#[macro_use]
extern crate tracing;

pub mod cnf;
pub mod config;
pub mod err;
pub mod flusher;
pub mod manager;
pub mod queue;
pub mod reader;
pub mod scan;
pub mod scheduler;
pub mod types;

pub use err::Error;
pub use types::*;
