//! Configuration loading and session bootstrap for delve.

pub mod bootstrap;
pub mod config;

pub use config::Config;
