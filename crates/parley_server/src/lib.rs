#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod engine;
pub mod server;
pub mod store;
