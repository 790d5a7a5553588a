//! Shared primitives: storage plumbing, configuration, errors and output helpers.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod output;
pub mod schemas;
pub mod store;
pub mod time;
