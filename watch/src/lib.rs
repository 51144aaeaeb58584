pub mod beacon;
pub mod cli;
pub mod config;
pub mod consistency;
mod error;
pub mod explorer;
pub mod fetcher;
pub mod metrics;
pub mod test_utils;
pub mod updater;
pub mod validators;

pub use error::Error;
