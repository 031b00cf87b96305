pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod session;
pub mod sniff;
pub mod stats;

pub use error::{Error, Result};
