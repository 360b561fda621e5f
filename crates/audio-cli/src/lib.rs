pub mod cli;
pub mod config;
pub mod recorder;
pub mod runtime;
