#![forbid(unsafe_code)]

pub mod app;
pub mod assemble;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod materialize;
pub mod model;
pub mod orchestrate;
pub mod prompt;
pub mod provider;
pub mod store;
