#[macro_use]
extern crate slog;

pub mod clock;
pub mod config;
pub mod error;
pub mod logger;

pub use error::{ConcordError, Result};
