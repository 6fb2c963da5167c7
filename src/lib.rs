pub mod adapters;
pub mod background;
pub mod bootstrap;
pub mod builder;
pub mod cli;
pub mod common;
pub mod config;
pub mod interfaces;
pub mod models;
pub mod operations;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use builder::Builder;
pub use config::{BuildOptions, BuilderConfig};
