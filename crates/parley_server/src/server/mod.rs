#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod health;
